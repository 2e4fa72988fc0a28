//! Discovery-driven resolver.
//!
//! A [`Resolver`] watches one service through a [`Discovery`] backend and
//! pushes the routable nodes of every snapshot to a [`Rebalancer`].
//!
//! # How It Works
//!
//! 1. Opens a watch for the target's endpoint (the service name)
//! 2. In blocking mode, waits for one snapshot and applies it before returning
//! 3. Spawns a background task that applies every further snapshot
//! 4. Retries transient fetch errors after a fixed backoff
//! 5. Stops when the caller's token is cancelled or [`Resolver::close`] is called

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::balancer::Rebalancer;
use crate::discovery::{Discovery, ServiceInstance, Watcher};
use crate::error::{Error, FetchError, Result};
use crate::node::build_nodes;
use crate::target::Target;

/// Default interval between retries after a failed fetch.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Configuration for a [`Resolver`].
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    /// Wait for the first snapshot before construction returns.
    pub block: bool,

    /// Route to plain endpoints instead of secured ones.
    pub insecure: bool,

    /// Delay before retrying after a failed fetch.
    pub backoff: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            block: false,
            insecure: false,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl ResolverConfig {
    /// Creates a non-blocking configuration that routes to secured endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether construction waits for the first snapshot.
    #[must_use]
    pub fn block(mut self, block: bool) -> Self {
        self.block = block;
        self
    }

    /// Sets whether plain endpoints are selected instead of secured ones.
    #[must_use]
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Sets the retry delay after a failed fetch.
    #[must_use]
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Lifecycle state of a [`Resolver`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// The watch is open and the first resolution has not completed.
    Initializing,
    /// The background task is running.
    Ready,
    /// The resolver has been closed.
    Closed,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initializing,
            1 => Self::Ready,
            _ => Self::Closed,
        }
    }
}

/// Keeps a rebalancer up to date with the instances of one service.
///
/// Dropping a resolver cancels its background task without stopping the
/// watch; call [`close`](Resolver::close) for an orderly shutdown.
pub struct Resolver {
    service: String,
    state: AtomicU8,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<Box<dyn Watcher>>>>,
}

impl Resolver {
    /// Opens a watch for `target` and starts resolving it in the background.
    ///
    /// The background task stops when `ctx` is cancelled or the resolver is
    /// closed. With [`ResolverConfig::block`] set, the first snapshot is
    /// fetched and applied to `rebalancer` before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WatchSetup`] if the watch cannot be opened, and
    /// [`Error::Resolution`] if the blocking fetch fails or `ctx` is cancelled
    /// before the watch is open or the fetch completes. No background task is
    /// left running on error.
    pub async fn new<R>(
        ctx: &CancellationToken,
        discovery: &dyn Discovery,
        target: &Target,
        rebalancer: R,
        config: ResolverConfig,
    ) -> Result<Self>
    where
        R: Rebalancer + 'static,
    {
        let service = target.endpoint.clone();
        let token = ctx.child_token();

        // A blocking start gives up on a backend that is still opening the
        // watch once `ctx` is cancelled.
        let opened = if config.block {
            tokio::select! {
                biased;
                opened = discovery.watch(&token, &service) => Some(opened),
                () = ctx.cancelled() => None,
            }
        } else {
            Some(discovery.watch(&token, &service).await)
        };

        let Some(opened) = opened else {
            return Err(Error::Resolution {
                service,
                source: FetchError::Cancelled,
            });
        };

        let mut watcher = opened.map_err(|source| Error::WatchSetup {
            service: service.clone(),
            source,
        })?;

        tracing::debug!("Watching service {service:?} for {target}");

        let resolver = Self {
            service,
            state: AtomicU8::new(State::Initializing as u8),
            token,
            task: Mutex::new(None),
        };

        let secure = !config.insecure;
        let mut rebalancer: Box<dyn Rebalancer> = Box::new(rebalancer);

        if config.block {
            match fetch(watcher.as_mut(), ctx).await {
                Ok(instances) => {
                    let nodes = build_nodes(&instances, secure);
                    tracing::debug!(
                        "Resolved {} nodes for service {:?}",
                        nodes.len(),
                        resolver.service
                    );
                    rebalancer.apply(nodes).await;
                }
                Err(source) => {
                    resolver.set_state(State::Closed);
                    if let Err(e) = watcher.stop().await {
                        tracing::warn!(
                            "failed to stop watcher for service {:?}: {e}",
                            resolver.service
                        );
                    }
                    return Err(Error::Resolution {
                        service: resolver.service.clone(),
                        source,
                    });
                }
            }
        }

        let watch_loop = WatchLoop {
            watcher,
            rebalancer,
            token: resolver.token.clone(),
            service: resolver.service.clone(),
            secure,
            backoff: config.backoff,
        };
        *resolver.task.lock().await = Some(tokio::spawn(watch_loop.run()));
        resolver.set_state(State::Ready);

        Ok(resolver)
    }

    /// The service name being resolved.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Stops the background task and then the watch.
    ///
    /// No node set is applied once this has been called. Only the first call
    /// does any work; later calls return `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stop`] if the watch fails to stop, or
    /// [`Error::LoopPanicked`] if the background task panicked. The resolver
    /// is closed either way.
    pub async fn close(&self) -> Result<()> {
        if self.swap_state(State::Closed) == State::Closed {
            return Ok(());
        }

        self.token.cancel();

        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };

        let mut watcher = task.await.map_err(|e| {
            tracing::error!("resolver task for service {:?} failed: {e}", self.service);
            Error::LoopPanicked
        })?;

        tracing::debug!("Stopping watcher for service {:?}", self.service);
        watcher.stop().await.map_err(Error::Stop)
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn swap_state(&self, state: State) -> State {
        State::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("service", &self.service)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Fetches the next snapshot unless `token` is cancelled first.
///
/// Cancellation is checked before the watcher is polled, so an already
/// cancelled token never consults the watch.
async fn fetch(
    watcher: &mut dyn Watcher,
    token: &CancellationToken,
) -> std::result::Result<Vec<ServiceInstance>, FetchError> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(FetchError::Cancelled),
        result = watcher.next() => result.map_err(FetchError::Discovery),
    }
}

/// Background task state; owns the watcher until the task ends.
struct WatchLoop {
    watcher: Box<dyn Watcher>,
    rebalancer: Box<dyn Rebalancer>,
    token: CancellationToken,
    service: String,
    secure: bool,
    backoff: Duration,
}

impl WatchLoop {
    /// Applies snapshots until cancelled, then hands the watcher back for stopping.
    async fn run(mut self) -> Box<dyn Watcher> {
        loop {
            match fetch(self.watcher.as_mut(), &self.token).await {
                Ok(instances) => {
                    let nodes = build_nodes(&instances, self.secure);
                    tracing::debug!(
                        "Resolved {} nodes for service {:?}",
                        nodes.len(),
                        self.service
                    );

                    tokio::select! {
                        biased;
                        () = self.token.cancelled() => break,
                        () = self.rebalancer.apply(nodes) => {}
                    }
                }
                Err(e) if e.is_cancelled() || self.token.is_cancelled() => break,
                Err(e) => {
                    tracing::warn!(
                        "failed to fetch instances of service {:?}, retrying in {:?}: {e}",
                        self.service,
                        self.backoff
                    );

                    tokio::select! {
                        biased;
                        () = self.token.cancelled() => break,
                        () = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }

        tracing::debug!("Resolver for service {:?} stopped", self.service);
        self.watcher
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::error::BoxError;
    use crate::node::Node;

    /// Scripted watcher: pops results from the front, then blocks forever.
    struct ScriptedWatcher {
        script: Vec<std::result::Result<Vec<ServiceInstance>, &'static str>>,
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Watcher for ScriptedWatcher {
        async fn next(&mut self) -> std::result::Result<Vec<ServiceInstance>, BoxError> {
            if self.script.is_empty() {
                std::future::pending::<()>().await;
            }
            self.script.remove(0).map_err(Into::into)
        }

        async fn stop(&mut self) -> std::result::Result<(), BoxError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Recorder(mpsc::UnboundedSender<Vec<Node>>);

    #[async_trait]
    impl Rebalancer for Recorder {
        async fn apply(&mut self, nodes: Vec<Node>) {
            let _ = self.0.send(nodes);
        }
    }

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance::new(id, "orders").endpoint(format!("http://10.0.0.{id}:8000"))
    }

    #[tokio::test]
    async fn fetch_checks_cancellation_first() {
        let stops = Arc::new(AtomicUsize::new(0));
        let mut watcher = ScriptedWatcher {
            script: vec![Ok(vec![instance("1")])],
            stops,
        };
        let token = CancellationToken::new();
        token.cancel();

        let err = fetch(&mut watcher, &token).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(watcher.script.len(), 1);
    }

    #[tokio::test]
    async fn fetch_wraps_backend_errors() {
        let mut watcher = ScriptedWatcher {
            script: vec![Err("registry unavailable")],
            stops: Arc::new(AtomicUsize::new(0)),
        };

        let err = fetch(&mut watcher, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!err.is_cancelled());
        assert_eq!(err.to_string(), "registry unavailable");
    }

    #[tokio::test]
    async fn watch_loop_retries_after_transient_error() {
        let stops = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let watch_loop = WatchLoop {
            watcher: Box::new(ScriptedWatcher {
                script: vec![
                    Ok(vec![instance("1")]),
                    Err("registry unavailable"),
                    Ok(vec![instance("2")]),
                ],
                stops: stops.clone(),
            }),
            rebalancer: Box::new(Recorder(tx)),
            token: token.clone(),
            service: "orders".to_string(),
            secure: false,
            backoff: Duration::from_millis(10),
        };
        let task = tokio::spawn(watch_loop.run());

        assert_eq!(rx.recv().await.unwrap()[0].address, "10.0.0.1:8000");
        assert_eq!(rx.recv().await.unwrap()[0].address, "10.0.0.2:8000");

        token.cancel();
        task.await.unwrap();
        assert_eq!(stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn watch_loop_applies_empty_sets() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let watch_loop = WatchLoop {
            watcher: Box::new(ScriptedWatcher {
                script: vec![Ok(vec![instance("1")])],
                stops: Arc::new(AtomicUsize::new(0)),
            }),
            rebalancer: Box::new(Recorder(tx)),
            token: token.clone(),
            service: "orders".to_string(),
            secure: true,
            backoff: Duration::from_millis(10),
        };
        let task = tokio::spawn(watch_loop.run());

        assert!(rx.recv().await.unwrap().is_empty());

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn watch_loop_backoff_is_cancellable() {
        let token = CancellationToken::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let watch_loop = WatchLoop {
            watcher: Box::new(ScriptedWatcher {
                script: vec![Err("registry unavailable")],
                stops: Arc::new(AtomicUsize::new(0)),
            }),
            rebalancer: Box::new(Recorder(tx)),
            token: token.clone(),
            service: "orders".to_string(),
            secure: false,
            backoff: Duration::from_secs(3600),
        };
        let task = tokio::spawn(watch_loop.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("loop did not stop during backoff")
            .unwrap();
    }

    #[test]
    fn config_builder() {
        let config = ResolverConfig::new()
            .block(true)
            .insecure(true)
            .backoff(Duration::from_millis(250));

        assert!(config.block);
        assert!(config.insecure);
        assert_eq!(config.backoff, Duration::from_millis(250));
    }

    #[test]
    fn config_defaults() {
        let config = ResolverConfig::default();

        assert!(!config.block);
        assert!(!config.insecure);
        assert_eq!(config.backoff, DEFAULT_BACKOFF);
    }

    #[test]
    fn state_round_trips_through_u8() {
        for state in [State::Initializing, State::Ready, State::Closed] {
            assert_eq!(State::from_u8(state as u8), state);
        }
    }
}
