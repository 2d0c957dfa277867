use busprims_link::LinkError;

/// Errors returned by transaction steps.
#[derive(Debug, thiserror::Error)]
pub enum TxnError {
    /// The step is not satisfied yet; call again later.
    #[error("step still waiting")]
    Waiting,

    /// The host requested an abort.
    #[error("transaction aborted")]
    Aborted,

    /// Link-level failure other than a timeout.
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// An SRQ arrived that no accepted value or handler claims.
    #[error("unexpected srq 0x{0:02x}")]
    UnexpectedSrq(u8),

    /// The peer's answer could not be understood.
    #[error("answer not understood: {0}")]
    Answer(String),

    /// `remove_to_mark` without a prior mark.
    #[error("no step mark set")]
    NoMark,

    /// `pop` without a matching `push`.
    #[error("no pushed transaction state")]
    NothingPushed,

    /// The counters or the mark are out of range.
    #[error("inconsistent transaction state: {0}")]
    Inconsistent(String),
}

impl TxnError {
    /// Whether calling the same operation again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Waiting => true,
            Self::Link(err) => err.is_timeout(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, TxnError>;
