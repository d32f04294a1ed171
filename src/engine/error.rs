use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed input. Raised before the store is touched whenever the
    /// input alone shows the problem.
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("resource {resource_id} already booked by {booking_id} during this time")]
    Conflict { resource_id: Ulid, booking_id: Ulid },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("resource {0} still has active bookings")]
    ResourceInUse(Ulid),
    /// The log writer failed or went away. Never retried here: a retry has to
    /// go through the whole conflict check again.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl SchedulerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SchedulerError::Validation(msg.into())
    }
}
