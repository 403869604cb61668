/// Longest rejection reason the ledger will store.
pub const MAX_REASON_LEN: usize = 500;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("transaction {id} is {status} and can no longer change state")]
    InvalidState { id: String, status: String },
    #[error(
        "requested {requested} of {item}, but only {supply} remain on the donation and {demand} on the request"
    )]
    QuantityExceedsAvailable {
        item: String,
        requested: u64,
        supply: u64,
        demand: u64,
    },
    #[error("allocation of {item} is stale: {requested} allocated, {remaining} remaining")]
    AllocationStale {
        item: String,
        requested: u64,
        remaining: u64,
    },
    #[error("a rejection reason is required")]
    MissingReason,
    #[error("rejection reason exceeds {MAX_REASON_LEN} characters")]
    ReasonTooLong,
    #[error("user {user} is not permitted to perform this action")]
    Unauthorized { user: String },
    #[error("donation and request categories do not match")]
    CategoryMismatch,
    #[error("allocation contains no lines")]
    EmptyAllocation,
    #[error("duplicate allocation line for {item}")]
    DuplicateLine { item: String },
    #[error("allocation line for {item} must be greater than zero")]
    ZeroQuantity { item: String },
}

impl LedgerError {
    pub fn not_found(kind: &'static str, id: &str) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn unauthorized(user: &str) -> Self {
        Self::Unauthorized {
            user: user.to_string(),
        }
    }
}
