//! Error types for resolver construction and shutdown.

/// Boxed error used by discovery backends and watch handles.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for resolver operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error returned by a single fetch from a watch handle.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The governing cancellation token was cancelled.
    #[error("operation was cancelled")]
    Cancelled,

    /// The discovery backend failed to produce a snapshot.
    #[error(transparent)]
    Discovery(BoxError),
}

impl FetchError {
    /// Returns `true` if the fetch was interrupted by cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Error returned by [`Resolver`](crate::Resolver) construction and shutdown.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The discovery backend could not establish a watch.
    #[error("failed to watch service {service:?}: {source}")]
    WatchSetup {
        /// The service name passed to the backend.
        service: String,
        /// The backend error.
        #[source]
        source: BoxError,
    },

    /// The first resolution of a blocking start failed.
    #[error("failed to resolve service {service:?}: {source}")]
    Resolution {
        /// The service name being resolved.
        service: String,
        /// Why the fetch failed.
        #[source]
        source: FetchError,
    },

    /// The watch handle failed to stop.
    #[error("failed to stop watcher: {0}")]
    Stop(#[source] BoxError),

    /// The background task panicked, so its watch handle could not be stopped.
    #[error("resolver task panicked")]
    LoopPanicked,
}
