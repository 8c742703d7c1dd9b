use gargantua_k8s_api::store;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A reconciliation failure.
///
/// Store failures are transient and retried with backoff. Invariant violations are reported on
/// the object and not retried until the object changes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] store::Error),

    #[error("{0}")]
    Invariant(String),
}

impl Error {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(error) => !matches!(error, store::Error::Invalid { .. }),
            Self::Invariant(_) => false,
        }
    }
}
