#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Discovery-driven name resolution for [Tonic](https://docs.rs/tonic) gRPC load balancing.
//!
//! A target address such as `discovery:///orders` names a service registered
//! with a discovery backend. This crate watches that service and feeds the
//! routable endpoints of every update to a rebalancer, for example a tonic
//! balance channel.
//!
//! # Features
//!
//! - **Target parsing**: bare `host:port` authorities or explicit URIs
//! - **Pluggable backends**: any [`Discovery`] implementation, or a stream via [`StreamWatcher`]
//! - **Transport security filtering**: only endpoints matching the transport are routed
//! - **Blocking or background start**: optionally wait for the first resolution
//! - **Self-healing**: transient backend errors are retried after a fixed backoff
//!
//! # Usage
//!
//! ```ignore
//! use tokio_util::sync::CancellationToken;
//! use tonic::transport::{Channel, Endpoint};
//! use tonic_lb_resolver::{BalanceChannel, Resolver, ResolverConfig, parse_target};
//!
//! let (channel, tx) = Channel::balance_channel::<String>(1024);
//! let rebalancer = BalanceChannel::new(tx, |node| {
//!     Endpoint::from_shared(format!("http://{}", node.address)).unwrap()
//! });
//!
//! let target = parse_target("discovery:///orders", true)?;
//! let config = ResolverConfig::new().block(true).insecure(true);
//! let ctx = CancellationToken::new();
//! let resolver = Resolver::new(&ctx, &registry, &target, rebalancer, config).await?;
//!
//! // Use the channel with your generated gRPC client
//! // let client = OrdersClient::new(channel);
//!
//! resolver.close().await?;
//! ```

mod balancer;
mod discovery;
mod error;
mod node;
mod resolver;
mod target;

pub use balancer::{BalanceChannel, Rebalancer};
pub use discovery::{Discovery, ServiceInstance, StreamWatcher, Watcher};
pub use error::{BoxError, Error, FetchError, Result};
pub use node::{Node, SECURE_QUERY_KEY, build_node, build_nodes, is_secure};
pub use resolver::{DEFAULT_BACKOFF, Resolver, ResolverConfig, State};
pub use target::{DISCOVERY_SCHEME, Target, TargetError, parse_target};
