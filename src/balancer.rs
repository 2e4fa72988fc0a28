//! Rebalancer capability and the tonic balance channel adapter.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;

use crate::node::Node;

/// Receives the node sets produced by a resolver.
///
/// Each call carries the complete set of routable nodes, which may be empty.
/// Calls from one resolver never overlap and arrive in snapshot order.
#[async_trait]
pub trait Rebalancer: Send {
    /// Replaces the current node set.
    async fn apply(&mut self, nodes: Vec<Node>);
}

/// A [`Rebalancer`] that feeds a tonic balance channel.
///
/// Node sets are diffed against the previously applied set, and the
/// differences are sent as [`Change`] events keyed by node address. The
/// caller decides how each [`Endpoint`] is built.
///
/// ```ignore
/// use tonic::transport::{Channel, Endpoint};
/// use tonic_lb_resolver::BalanceChannel;
///
/// let (channel, tx) = Channel::balance_channel::<String>(1024);
/// let rebalancer = BalanceChannel::new(tx, |node| {
///     let scheme = if node.secure { "https" } else { "http" };
///     Endpoint::from_shared(format!("{scheme}://{}", node.address)).unwrap()
/// });
/// ```
pub struct BalanceChannel<F> {
    tx: Sender<Change<String, Endpoint>>,
    build: F,
    known: HashMap<String, Node>,
    closed: bool,
}

impl<F> BalanceChannel<F>
where
    F: Fn(&Node) -> Endpoint + Send,
{
    /// Creates an adapter sending changes to `tx`, building endpoints with `build`.
    #[must_use]
    pub fn new(tx: Sender<Change<String, Endpoint>>, build: F) -> Self {
        Self {
            tx,
            build,
            known: HashMap::new(),
            closed: false,
        }
    }
}

impl<F> std::fmt::Debug for BalanceChannel<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalanceChannel")
            .field("known", &self.known.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> Rebalancer for BalanceChannel<F>
where
    F: Fn(&Node) -> Endpoint + Send,
{
    async fn apply(&mut self, nodes: Vec<Node>) {
        if self.closed {
            return;
        }

        for action in diff_nodes(&mut self.known, nodes) {
            let change = match action {
                NodeAction::Insert(node) => {
                    tracing::debug!("adding endpoint: {}", node.address);
                    Change::Insert(node.address.clone(), (self.build)(&node))
                }
                NodeAction::Remove(address) => {
                    tracing::debug!("removing endpoint: {address}");
                    Change::Remove(address)
                }
            };

            if self.tx.send(change).await.is_err() {
                tracing::warn!("balance channel closed, dropping further node updates");
                self.closed = true;
                return;
            }
        }
    }
}

/// Represents a change to the applied node set.
#[derive(Debug, Clone, PartialEq, Eq)]
enum NodeAction {
    Insert(Node),
    Remove(String),
}

/// Updates `known` to match `nodes` and returns the changes made.
///
/// A node whose address is already known is inserted again only if it
/// differs from the known one.
fn diff_nodes(known: &mut HashMap<String, Node>, nodes: Vec<Node>) -> Vec<NodeAction> {
    let current: HashMap<String, Node> = nodes
        .into_iter()
        .map(|node| (node.address.clone(), node))
        .collect();

    let mut actions = Vec::new();

    known.retain(|address, _| {
        let keep = current.contains_key(address);
        if !keep {
            actions.push(NodeAction::Remove(address.clone()));
        }
        keep
    });

    for (address, node) in current {
        if known.get(&address) != Some(&node) {
            known.insert(address, node.clone());
            actions.push(NodeAction::Insert(node));
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn node(address: &str) -> Node {
        Node {
            address: address.to_string(),
            secure: false,
            id: address.to_string(),
            name: "orders".to_string(),
            version: "v1".to_string(),
            metadata: HashMap::new(),
        }
    }

    fn endpoint(node: &Node) -> Endpoint {
        Endpoint::from_shared(format!("http://{}", node.address)).unwrap()
    }

    fn describe(change: Change<String, Endpoint>) -> String {
        match change {
            Change::Insert(key, _) => format!("+{key}"),
            Change::Remove(key) => format!("-{key}"),
        }
    }

    // diff_nodes tests

    #[test]
    fn diff_inserts_new_nodes() {
        let mut known = HashMap::new();
        let actions = diff_nodes(&mut known, vec![node("10.0.0.1:80"), node("10.0.0.2:80")]);

        assert_eq!(actions.len(), 2);
        assert!(actions.contains(&NodeAction::Insert(node("10.0.0.1:80"))));
        assert!(actions.contains(&NodeAction::Insert(node("10.0.0.2:80"))));
        assert_eq!(known.len(), 2);
    }

    #[test]
    fn diff_skips_unchanged_nodes() {
        let mut known = HashMap::new();
        diff_nodes(&mut known, vec![node("10.0.0.1:80")]);

        let actions = diff_nodes(&mut known, vec![node("10.0.0.1:80"), node("10.0.0.2:80")]);

        assert_eq!(actions, vec![NodeAction::Insert(node("10.0.0.2:80"))]);
    }

    #[test]
    fn diff_removes_vanished_nodes() {
        let mut known = HashMap::new();
        diff_nodes(&mut known, vec![node("10.0.0.1:80"), node("10.0.0.2:80")]);

        let actions = diff_nodes(&mut known, vec![node("10.0.0.2:80")]);

        assert_eq!(actions, vec![NodeAction::Remove("10.0.0.1:80".to_string())]);
        assert_eq!(known.len(), 1);
    }

    #[test]
    fn diff_empty_set_removes_everything() {
        let mut known = HashMap::new();
        diff_nodes(&mut known, vec![node("10.0.0.1:80")]);

        let actions = diff_nodes(&mut known, Vec::new());

        assert_eq!(actions, vec![NodeAction::Remove("10.0.0.1:80".to_string())]);
        assert!(known.is_empty());
    }

    #[test]
    fn diff_reinserts_changed_node() {
        let mut known = HashMap::new();
        diff_nodes(&mut known, vec![node("10.0.0.1:80")]);

        let mut upgraded = node("10.0.0.1:80");
        upgraded.version = "v2".to_string();
        let actions = diff_nodes(&mut known, vec![upgraded.clone()]);

        assert_eq!(actions, vec![NodeAction::Insert(upgraded)]);
        assert_eq!(known.len(), 1);
    }

    // BalanceChannel tests

    #[tokio::test]
    async fn balance_channel_sends_changes() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut balancer = BalanceChannel::new(tx, endpoint);

        balancer.apply(vec![node("10.0.0.1:80")]).await;
        assert_eq!(describe(rx.recv().await.unwrap()), "+10.0.0.1:80");

        balancer.apply(vec![node("10.0.0.2:80")]).await;
        let mut changes = vec![
            describe(rx.recv().await.unwrap()),
            describe(rx.recv().await.unwrap()),
        ];
        changes.sort();
        assert_eq!(changes, ["+10.0.0.2:80", "-10.0.0.1:80"]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn balance_channel_stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(16);
        let mut balancer = BalanceChannel::new(tx, endpoint);
        drop(rx);

        balancer.apply(vec![node("10.0.0.1:80")]).await;
        assert!(balancer.closed);

        balancer.apply(vec![node("10.0.0.2:80")]).await;
        assert_eq!(balancer.known.len(), 1);
    }
}
