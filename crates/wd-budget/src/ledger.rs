// ledger.rs — The budget ledger.
//
// All operations run under one lock: the ledger is the primary contended
// resource, and serializing it keeps reserve/commit/release atomic without
// any retry loops. Open reservations are tracked until they finalize. The
// last FINALIZED_HISTORY finalized ids are remembered so a second commit or
// release is reported as AlreadyFinalized; older ones fall back to
// UnknownReservation. Either way nothing is counted twice.
//
// The cap is monthly (UTC calendar month). When a call's `now` falls in a
// later month than the ledger's current period, spend resets, the cap
// returns to its configured base and the finalized history is dropped.
// Outstanding reservations carry over.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BudgetError;

/// Finalized reservation ids remembered for double-finalize detection.
pub const FINALIZED_HISTORY: usize = 1024;

/// A calendar month, the ledger's accounting period.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct BudgetPeriod {
    pub year: i32,
    pub month: u32,
}

impl BudgetPeriod {
    pub fn containing(now: DateTime<Utc>) -> Self {
        Self {
            year: now.year(),
            month: now.month(),
        }
    }
}

impl fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Lifecycle of a reservation. COMMITTED and RELEASED are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReservationState {
    Reserved,
    Committed { audit_sequence: u64 },
    Released,
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReservationState::Reserved => write!(f, "reserved"),
            ReservationState::Committed { .. } => write!(f, "committed"),
            ReservationState::Released => write!(f, "released"),
        }
    }
}

/// A hold on part of the available budget, returned by `reserve`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub id: Uuid,
    pub amount_cents: u64,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time view of the ledger, passed to the policy engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BudgetSnapshot {
    pub period: BudgetPeriod,
    pub cap_cents: u64,
    pub spent_cents: u64,
    pub reserved_cents: u64,
    pub remaining_cents: u64,
}

#[derive(Debug)]
struct LedgerState {
    base_cap_cents: u64,
    cap_cents: u64,
    spent_cents: u64,
    reserved_cents: u64,
    period: BudgetPeriod,
    /// Reserved and not yet committed or released: id → amount.
    open: HashMap<Uuid, u64>,
    finalized: HashMap<Uuid, ReservationState>,
    /// Finalization order, oldest first, for eviction.
    finalized_order: VecDeque<Uuid>,
    /// (audit sequence, amount) of each cap override this period.
    overrides: Vec<(u64, u64)>,
}

impl LedgerState {
    fn roll(&mut self, now: DateTime<Utc>) {
        let current = BudgetPeriod::containing(now);
        if current > self.period {
            tracing::info!(
                from = %self.period,
                to = %current,
                spent_cents = self.spent_cents,
                "budget period rolled over"
            );
            self.period = current;
            self.spent_cents = 0;
            self.cap_cents = self.base_cap_cents;
            self.overrides.clear();
            self.finalized.clear();
            self.finalized_order.clear();
        }
    }

    fn remaining(&self) -> u64 {
        self.cap_cents
            .saturating_sub(self.spent_cents)
            .saturating_sub(self.reserved_cents)
    }

    fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            period: self.period,
            cap_cents: self.cap_cents,
            spent_cents: self.spent_cents,
            reserved_cents: self.reserved_cents,
            remaining_cents: self.remaining(),
        }
    }

    fn finalize(
        &mut self,
        id: Uuid,
        next: ReservationState,
    ) -> Result<u64, BudgetError> {
        let amount = match self.open.remove(&id) {
            Some(amount) => amount,
            None => {
                return Err(match self.finalized.get(&id) {
                    Some(state) => BudgetError::AlreadyFinalized { id, state: *state },
                    None => BudgetError::UnknownReservation(id),
                })
            }
        };
        self.finalized.insert(id, next);
        self.finalized_order.push_back(id);
        while self.finalized_order.len() > FINALIZED_HISTORY {
            if let Some(oldest) = self.finalized_order.pop_front() {
                self.finalized.remove(&oldest);
            }
        }
        Ok(amount)
    }
}

/// The budget ledger. Share it as `Arc<BudgetLedger>`.
pub struct BudgetLedger {
    inner: Mutex<LedgerState>,
}

impl BudgetLedger {
    /// Create a ledger with the given monthly cap, starting in `now`'s month.
    pub fn new(monthly_cap_cents: u64, now: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(LedgerState {
                base_cap_cents: monthly_cap_cents,
                cap_cents: monthly_cap_cents,
                spent_cents: 0,
                reserved_cents: 0,
                period: BudgetPeriod::containing(now),
                open: HashMap::new(),
                finalized: HashMap::new(),
                finalized_order: VecDeque::new(),
                overrides: Vec::new(),
            }),
        }
    }

    /// Reserve `amount_cents`, taking it out of the available budget now.
    pub fn reserve(
        &self,
        amount_cents: u64,
        now: DateTime<Utc>,
    ) -> Result<Reservation, BudgetError> {
        let mut state = self.inner.lock().map_err(|_| BudgetError::Poisoned)?;
        state.roll(now);

        let remaining = state.remaining();
        if amount_cents > remaining {
            tracing::warn!(
                requested_cents = amount_cents,
                remaining_cents = remaining,
                "budget reservation denied"
            );
            return Err(BudgetError::BudgetExceeded {
                requested_cents: amount_cents,
                remaining_cents: remaining,
            });
        }

        state.reserved_cents = state
            .reserved_cents
            .checked_add(amount_cents)
            .ok_or(BudgetError::Overflow)?;
        let reservation = Reservation {
            id: Uuid::new_v4(),
            amount_cents,
            created_at: now,
        };
        state.open.insert(reservation.id, amount_cents);
        tracing::debug!(reservation = %reservation.id, amount_cents, "budget reserved");
        Ok(reservation)
    }

    /// Turn a reservation into spend. `audit_sequence` is the committed audit
    /// event recording this spend.
    pub fn commit(&self, reservation_id: Uuid, audit_sequence: u64) -> Result<u64, BudgetError> {
        let mut state = self.inner.lock().map_err(|_| BudgetError::Poisoned)?;
        let amount = state.finalize(
            reservation_id,
            ReservationState::Committed { audit_sequence },
        )?;
        state.reserved_cents -= amount;
        state.spent_cents += amount;
        tracing::info!(
            reservation = %reservation_id,
            amount_cents = amount,
            audit_sequence,
            "budget committed"
        );
        Ok(amount)
    }

    /// Return a reservation's amount to the available budget.
    pub fn release(&self, reservation_id: Uuid) -> Result<u64, BudgetError> {
        let mut state = self.inner.lock().map_err(|_| BudgetError::Poisoned)?;
        let amount = state.finalize(reservation_id, ReservationState::Released)?;
        state.reserved_cents -= amount;
        tracing::debug!(reservation = %reservation_id, amount_cents = amount, "budget released");
        Ok(amount)
    }

    /// Raise the cap for the current period. `audit_sequence` is the
    /// `budget_override` event carrying the operator's authorization.
    pub fn override_cap(
        &self,
        additional_cents: u64,
        audit_sequence: u64,
        now: DateTime<Utc>,
    ) -> Result<BudgetSnapshot, BudgetError> {
        let mut state = self.inner.lock().map_err(|_| BudgetError::Poisoned)?;
        state.roll(now);
        state.cap_cents = state
            .cap_cents
            .checked_add(additional_cents)
            .ok_or(BudgetError::Overflow)?;
        state.overrides.push((audit_sequence, additional_cents));
        tracing::warn!(
            additional_cents,
            audit_sequence,
            cap_cents = state.cap_cents,
            "budget cap overridden"
        );
        Ok(state.snapshot())
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> Result<BudgetSnapshot, BudgetError> {
        let mut state = self.inner.lock().map_err(|_| BudgetError::Poisoned)?;
        state.roll(now);
        Ok(state.snapshot())
    }

    /// Current state of a reservation.
    pub fn reservation_state(&self, id: Uuid) -> Result<ReservationState, BudgetError> {
        let state = self.inner.lock().map_err(|_| BudgetError::Poisoned)?;
        if state.open.contains_key(&id) {
            return Ok(ReservationState::Reserved);
        }
        state
            .finalized
            .get(&id)
            .copied()
            .ok_or(BudgetError::UnknownReservation(id))
    }

    /// Reservation records held in memory: open ones plus the finalized
    /// history.
    pub fn tracked_reservations(&self) -> Result<usize, BudgetError> {
        let state = self.inner.lock().map_err(|_| BudgetError::Poisoned)?;
        Ok(state.open.len() + state.finalized.len())
    }

    /// Audit sequences of the overrides applied this period.
    pub fn override_sequences(&self) -> Result<Vec<u64>, BudgetError> {
        let state = self.inner.lock().map_err(|_| BudgetError::Poisoned)?;
        Ok(state.overrides.iter().map(|(seq, _)| *seq).collect())
    }
}
