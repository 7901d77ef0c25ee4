//! Logical stream catalog entries.

use serde::{Deserialize, Serialize};

/// Placeholder substituted with the namespace in namespace-scoped paths.
pub const NAMESPACE_PLACEHOLDER: &str = "{namespace}";

/// A named, independently subscribable feed exposed by the server.
///
/// Entries are discovered out-of-band and are immutable once handed to the
/// engine. A namespace-scoped stream carries [`NAMESPACE_PLACEHOLDER`] in its
/// path; one data channel is opened per namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalStream {
    /// Stream name, as used on the control channel.
    pub name: String,
    /// URL path of the streaming endpoint.
    pub url_path: String,
    /// Whether the stream is opened once per namespace.
    #[serde(default)]
    pub namespaced: bool,
}

impl LogicalStream {
    /// Creates a cluster-wide stream.
    pub fn new(name: impl Into<String>, url_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url_path: url_path.into(),
            namespaced: false,
        }
    }

    /// Creates a namespace-scoped stream.
    pub fn namespaced(name: impl Into<String>, url_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url_path: url_path.into(),
            namespaced: true,
        }
    }

    /// Resolves the URL path for a namespace.
    ///
    /// Cluster-wide streams ignore the namespace.
    pub fn path_for(&self, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) if self.namespaced => self.url_path.replace(NAMESPACE_PLACEHOLDER, ns),
            _ => self.url_path.clone(),
        }
    }
}
