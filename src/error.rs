use ethers::types::H256;

/// Result alias used across the engine.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How the engine reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network flakiness; retried with bounded backoff.
    Transient,
    /// A definitive negative answer; never retried.
    NotFound,
    /// Consistency violation; halts the affected loop.
    Fatal,
    /// On-chain submission problem; surfaced to the caller, never resubmitted.
    Submission,
    /// Cooperative cancellation reached a suspension point.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("rpc unavailable: {0}")]
    RpcUnavailable(String),

    #[error("DA node unavailable: {0}")]
    DaUnavailable(String),

    #[error("DA node rejected blob: {0}")]
    DaRejected(String),

    /// The transaction was sent but its fate is unknown. Re-query by hash
    /// before doing anything else.
    #[error("submission of {tx_hash:?} timed out, it may still be pending")]
    Timeout { tx_hash: H256 },

    #[error("committed header not found: {0}")]
    HeaderNotFound(String),

    #[error("L2 block not found: {0}")]
    BlockNotFound(String),

    #[error("L2 transaction not found: {0:?}")]
    TransactionNotFound(H256),

    #[error("DA data not found: {0}")]
    DaNotFound(String),

    #[error("datum {datum:?} is not part of bundle {bundle:?}")]
    DatumNotInBundle { datum: H256, bundle: H256 },

    #[error("chain divergence at L1 index {index}: {reason}")]
    ChainDivergence { index: u64, reason: String },

    #[error("non-contiguous L2 blocks: expected {expected}, got {found}")]
    NonContiguousBlocks { expected: u64, found: u64 },

    /// The L2 node advertised `height` but could not serve the block.
    #[error("L2 block {height} advertised but missing: {reason}")]
    MissingBlock { height: u64, reason: String },

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("malformed bundle blob: {0}")]
    MalformedBlob(String),

    #[error("invalid inclusion proof: {0}")]
    InvalidProof(String),

    #[error("submission failed: {0}")]
    SubmissionFailed(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("state store: {0}")]
    Store(String),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::RpcUnavailable(_)
            | Error::DaUnavailable(_)
            | Error::Timeout { .. }
            | Error::Store(_) => ErrorClass::Transient,
            Error::HeaderNotFound(_)
            | Error::BlockNotFound(_)
            | Error::TransactionNotFound(_)
            | Error::DaNotFound(_)
            | Error::DatumNotInBundle { .. } => ErrorClass::NotFound,
            Error::ChainDivergence { .. }
            | Error::NonContiguousBlocks { .. }
            | Error::MissingBlock { .. }
            | Error::MalformedHeader(_)
            | Error::MalformedBlob(_)
            | Error::InvalidProof(_)
            | Error::DaRejected(_) => ErrorClass::Fatal,
            Error::SubmissionFailed(_) | Error::InsufficientFunds(_) | Error::SigningFailed(_) => {
                ErrorClass::Submission
            }
            Error::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Whether a blind retry of the same call is safe.
    ///
    /// `Timeout` is transient but ambiguous: retrying could double-submit.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient && !matches!(self, Error::Timeout { .. })
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}
