//! Discovery backend capabilities.
//!
//! A [`Discovery`] backend opens a [`Watcher`] for a service name. The
//! watcher yields successive snapshots of the service's instances until it is
//! stopped. Backends that already expose their updates as a stream can be
//! adapted with [`StreamWatcher`].

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;

/// One registered instance of a service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceInstance {
    /// Unique instance identifier.
    pub id: String,
    /// The service name.
    pub name: String,
    /// The deployed version.
    pub version: String,
    /// Free-form instance metadata.
    pub metadata: HashMap<String, String>,
    /// Endpoint URIs in order of preference, e.g. `https://10.0.0.1:8443`.
    ///
    /// An `isSecure` query parameter overrides the security implied by the
    /// scheme.
    pub endpoints: Vec<String>,
}

impl ServiceInstance {
    /// Creates an instance with no version, metadata or endpoints.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the version.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Appends an endpoint URI.
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }
}

/// A service discovery backend.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Opens a watch over the instances of `service_name`.
    ///
    /// `ctx` is cancelled when the caller's token is cancelled or the
    /// resolver is closed; a backend may tie the watch's lifetime to it.
    async fn watch(
        &self,
        ctx: &CancellationToken,
        service_name: &str,
    ) -> Result<Box<dyn Watcher>, BoxError>;
}

/// A live subscription to a service's instances.
///
/// The resolver races [`next`](Watcher::next) against cancellation and drops
/// the pending future when cancelled, so implementations must be cancel safe.
#[async_trait]
pub trait Watcher: Send {
    /// Waits for the next snapshot of instances.
    async fn next(&mut self) -> Result<Vec<ServiceInstance>, BoxError>;

    /// Stops the watch and releases its resources.
    ///
    /// The resolver calls this at most once.
    async fn stop(&mut self) -> Result<(), BoxError>;
}

/// A [`Watcher`] backed by a stream of snapshots.
///
/// The end of the stream is reported as an error, so the resolver keeps
/// retrying with backoff instead of exiting.
pub struct StreamWatcher {
    stream: Option<BoxStream<'static, Result<Vec<ServiceInstance>, BoxError>>>,
}

impl StreamWatcher {
    /// Wraps a stream of snapshots.
    #[must_use]
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Vec<ServiceInstance>, BoxError>> + Send + 'static,
    {
        Self {
            stream: Some(stream.boxed()),
        }
    }
}

impl std::fmt::Debug for StreamWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWatcher")
            .field("stopped", &self.stream.is_none())
            .finish()
    }
}

#[async_trait]
impl Watcher for StreamWatcher {
    async fn next(&mut self) -> Result<Vec<ServiceInstance>, BoxError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err("watcher stopped".into());
        };

        match stream.next().await {
            Some(snapshot) => snapshot,
            None => Err("watch stream ended".into()),
        }
    }

    async fn stop(&mut self) -> Result<(), BoxError> {
        self.stream = None;
        Ok(())
    }
}
