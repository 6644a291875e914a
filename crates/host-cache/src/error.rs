use serde::{Deserialize, Serialize};

/// Error kinds produced by the resolution pipeline.
///
/// Success is not a variant: fallible operations return `Result` and
/// cached results store `Option<ResolveError>`. Pending-ness is likewise
/// expressed structurally, by the start outcome of a request.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, thiserror::Error, Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResolveError {
    /// No usable result after every task failed, or the squashed form of
    /// most other errors.
    #[error("host name could not be resolved")]
    NameNotResolved,
    /// The local resolution phase found nothing; drives the task sequence.
    #[error("no usable entry in the host cache")]
    CacheMiss,
    /// The request was dropped before completion. Never surfaced through
    /// a completion callback.
    #[error("request cancelled before completion")]
    Cancelled,
    /// The job was evicted because the dispatch queue is over capacity.
    #[error("resolver queue is over capacity")]
    QueueTooLarge,
    /// The job was aborted by a network-environment transition.
    #[error("network changed while resolving")]
    NetworkChanged,
    /// The owning resolve context was destroyed.
    #[error("resolve context was shut down")]
    ContextShutDown,
    /// The result carried the ICANN name-collision sentinel 127.0.53.53.
    #[error("host collides with the ICANN name collision sentinel")]
    IcannNameCollision,
    /// DNS signalled that the name is reachable only over HTTPS. Fatal;
    /// no fallback tasks run.
    #[error("host is reachable only over https")]
    HttpsOnly,
    /// No network connectivity at all.
    #[error("internet connection is disconnected")]
    InternetDisconnected,
}

impl ResolveError {
    /// Maps an internal error to the form surfaced to callers: a small
    /// allow-list passes through, everything else reads as
    /// [`ResolveError::NameNotResolved`].
    pub fn squash(self) -> ResolveError {
        match self {
            ResolveError::NameNotResolved
            | ResolveError::InternetDisconnected
            | ResolveError::HttpsOnly => self,
            _ => ResolveError::NameNotResolved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squash_passes_allow_list_through() {
        for error in [
            ResolveError::NameNotResolved,
            ResolveError::InternetDisconnected,
            ResolveError::HttpsOnly,
        ] {
            assert_eq!(error.squash(), error);
        }
    }

    #[test]
    fn squash_maps_internal_errors_to_name_not_resolved() {
        for error in [
            ResolveError::CacheMiss,
            ResolveError::Cancelled,
            ResolveError::QueueTooLarge,
            ResolveError::NetworkChanged,
            ResolveError::ContextShutDown,
            ResolveError::IcannNameCollision,
        ] {
            assert_eq!(error.squash(), ResolveError::NameNotResolved);
        }
    }
}
