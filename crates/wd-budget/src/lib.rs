//! # wd-budget
//!
//! Spend tracking against a monthly cap, in integer cents.
//!
//! The ledger uses a reservation-then-commit pattern so concurrent tasks can
//! never double-spend: [`BudgetLedger::reserve`] takes the amount out of the
//! available budget immediately, [`BudgetLedger::commit`] turns it into spend
//! once the task succeeded (tied to the audit event that records it), and
//! [`BudgetLedger::release`] hands it back when the task failed.
//!
//! ## Key invariants
//!
//! - `spent + reserved <= cap` after every operation.
//! - A reservation is finalized exactly once: RESERVED → COMMITTED | RELEASED.
//! - The cap only grows through [`BudgetLedger::override_cap`], which requires
//!   the sequence number of the audit event authorizing it.

pub mod error;
pub mod ledger;

pub use error::BudgetError;
pub use ledger::{
    BudgetLedger, BudgetPeriod, BudgetSnapshot, Reservation, ReservationState, FINALIZED_HISTORY,
};
