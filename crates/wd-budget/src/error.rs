// error.rs — Error types for the budget ledger.

use thiserror::Error;
use uuid::Uuid;

use crate::ledger::ReservationState;

/// Errors that can occur during ledger operations.
#[derive(Debug, Error)]
pub enum BudgetError {
    /// The reservation would push spend past the cap. Recoverable: the
    /// caller may retry with a lower cost or wait for the next period.
    #[error("budget exceeded: requested {requested_cents} cents, {remaining_cents} cents remaining")]
    BudgetExceeded {
        requested_cents: u64,
        remaining_cents: u64,
    },

    /// No reservation with this id exists.
    #[error("unknown reservation: {0}")]
    UnknownReservation(Uuid),

    /// The reservation already reached a terminal state.
    #[error("reservation {id} already finalized as {state}")]
    AlreadyFinalized { id: Uuid, state: ReservationState },

    /// Arithmetic on amounts overflowed.
    #[error("amount overflow")]
    Overflow,

    /// Another thread panicked while holding the ledger lock.
    #[error("budget ledger lock poisoned")]
    Poisoned,
}
