//! Conversion of service instances into routable nodes.

use std::collections::HashMap;

use url::Url;

use crate::discovery::ServiceInstance;
use crate::target::split_authority;

/// Query parameter that declares an endpoint's transport security explicitly.
///
/// Accepted values are `1`, `t`, `T`, `TRUE`, `true`, `True` and `0`, `f`, `F`,
/// `FALSE`, `false`, `False`; anything else leaves the decision to the scheme.
pub const SECURE_QUERY_KEY: &str = "isSecure";

/// A routable address derived from a [`ServiceInstance`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// The endpoint's `host[:port]` as written in its URI.
    pub address: String,
    /// Whether the endpoint expects a secured transport.
    pub secure: bool,
    /// Identifier of the originating instance.
    pub id: String,
    /// Service name of the originating instance.
    pub name: String,
    /// Version of the originating instance.
    pub version: String,
    /// Metadata copied from the originating instance.
    pub metadata: HashMap<String, String>,
}

/// Builds a node from the first endpoint of `instance` whose transport
/// security matches `secure`.
///
/// Returns `None` if no endpoint matches; such an instance is not routable
/// over the current transport.
#[must_use]
pub fn build_node(instance: &ServiceInstance, secure: bool) -> Option<Node> {
    let address = instance.endpoints.iter().find_map(|endpoint| {
        let url = match Url::parse(endpoint) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(
                    "skipping endpoint {endpoint:?} of instance {}: {e}",
                    instance.id
                );
                return None;
            }
        };

        if is_secure(&url) == secure {
            host_port(endpoint)
        } else {
            None
        }
    })?;

    Some(Node {
        address,
        secure,
        id: instance.id.clone(),
        name: instance.name.clone(),
        version: instance.version.clone(),
        metadata: instance.metadata.clone(),
    })
}

/// Builds the node set for one snapshot, dropping instances that have no
/// matching endpoint.
#[must_use]
pub fn build_nodes(instances: &[ServiceInstance], secure: bool) -> Vec<Node> {
    instances
        .iter()
        .filter_map(|instance| build_node(instance, secure))
        .collect()
}

/// Reports whether an endpoint expects a secured transport.
///
/// An `isSecure` query parameter takes precedence over the scheme.
#[must_use]
pub fn is_secure(url: &Url) -> bool {
    let declared = url
        .query_pairs()
        .find(|(key, _)| key == SECURE_QUERY_KEY)
        .and_then(|(_, value)| parse_bool(&value));

    declared.unwrap_or_else(|| matches!(url.scheme(), "https" | "grpcs"))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// The authority of an endpoint URI exactly as written, so the address keeps
/// its case and no default port is filled in.
fn host_port(endpoint: &str) -> Option<String> {
    let (authority, _) = split_authority(endpoint);
    (!authority.is_empty()).then(|| authority.to_string())
}
