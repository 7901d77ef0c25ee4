//! Desired-state table of logical streams.
//!
//! The registry owns the endpoint catalog, the set of desired subscriptions
//! and the namespace snapshot, and computes which data channels should exist.
//! It performs no I/O; the engine turns its answers into connections.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use streamsync_protocol::{LogicalStream, StreamParams, StreamRequirements};

/// Identifies one data channel: a stream, optionally within a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    /// Stream name.
    pub stream: String,
    /// Namespace for namespace-scoped streams.
    pub namespace: Option<String>,
}

impl ChannelKey {
    /// Key for a cluster-wide channel.
    pub fn cluster(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            namespace: None,
        }
    }

    /// Key for a namespace-scoped channel.
    pub fn scoped(stream: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            namespace: Some(namespace.into()),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}@{}", self.stream, ns),
            None => f.write_str(&self.stream),
        }
    }
}

/// Everything needed to open one data channel, minus the event-client identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Channel identity.
    pub key: ChannelKey,
    /// Endpoint path.
    pub path: String,
    /// Extra query parameters.
    pub query: Vec<(String, String)>,
    /// `Accept` override.
    pub accept: Option<String>,
}

/// A consumer-defined query stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdHocQuery {
    /// Stream name.
    pub name: String,
    /// Query expression.
    pub query_text: String,
    /// Optional namespace filter.
    pub namespace_filter: Option<String>,
}

/// How a desired stream is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// A plain catalog stream.
    Catalog,
    /// A catalog stream opened with explicit parameters.
    Parameterized(StreamParams),
    /// An ad-hoc query stream.
    Query(AdHocQuery),
}

/// A desired stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Stream name.
    pub name: String,
    /// How it is opened.
    pub kind: SubscriptionKind,
}

/// Outcome of a query subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryChange {
    /// The stream was not desired before.
    Added,
    /// The query text or filter changed; open channels are stale.
    Replaced,
    /// Same query as before.
    Unchanged,
}

/// The desired-state table.
#[derive(Debug)]
pub struct StreamRegistry {
    catalog: BTreeMap<String, LogicalStream>,
    requirements: StreamRequirements,
    subscriptions: BTreeMap<String, Subscription>,
    suppressed: BTreeSet<String>,
    namespaces: BTreeSet<String>,
    auto_activate: bool,
    query_path: String,
}

impl StreamRegistry {
    /// Creates an empty registry.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            catalog: BTreeMap::new(),
            requirements: config.requirements.clone(),
            subscriptions: BTreeMap::new(),
            suppressed: BTreeSet::new(),
            namespaces: BTreeSet::new(),
            auto_activate: config.auto_activate_catalog,
            query_path: config.query_path.clone(),
        }
    }

    /// Replaces the endpoint catalog. Opens nothing.
    pub fn set_catalog(&mut self, entries: impl IntoIterator<Item = LogicalStream>) {
        self.catalog = entries
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect();
    }

    /// Returns true for reserved names that are never opened automatically.
    pub fn is_excluded_from_auto_start(&self, name: &str) -> bool {
        self.requirements.is_excluded(name)
    }

    /// Replaces the namespace snapshot.
    ///
    /// Returns the channels to open for namespaces that were not present
    /// before. Channels of removed namespaces are left alone; they disappear
    /// on the next reconnect.
    pub fn set_namespaces<I, S>(&mut self, names: I) -> Vec<ChannelSpec>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let next: BTreeSet<String> = names.into_iter().map(Into::into).collect();
        let added: Vec<String> = next.difference(&self.namespaces).cloned().collect();
        self.namespaces = next;

        let mut specs = Vec::new();
        for sub in self.subscriptions.values() {
            let params = match &sub.kind {
                SubscriptionKind::Catalog => None,
                SubscriptionKind::Parameterized(params) => Some(params),
                SubscriptionKind::Query(_) => continue,
            };
            let Some(entry) = self.catalog.get(&sub.name).filter(|e| e.namespaced) else {
                continue;
            };
            for ns in &added {
                specs.push(self.catalog_spec(entry, Some(ns), params));
            }
        }
        specs
    }

    /// Current namespace snapshot.
    pub fn namespaces(&self) -> &BTreeSet<String> {
        &self.namespaces
    }

    /// Marks a catalog stream desired.
    ///
    /// Reserved names need their parameters and are refused here unless
    /// already subscribed through [`StreamRegistry::subscribe_with`] or
    /// [`StreamRegistry::subscribe_query`].
    pub fn subscribe(&mut self, name: &str) -> EngineResult<()> {
        self.suppressed.remove(name);
        if self.subscriptions.contains_key(name) {
            return Ok(());
        }
        self.requirements
            .validate(name, &StreamParams::new())
            .map_err(|e| EngineError::Config(e.to_string()))?;
        self.subscriptions.insert(
            name.to_string(),
            Subscription {
                name: name.to_string(),
                kind: SubscriptionKind::Catalog,
            },
        );
        Ok(())
    }

    /// Marks a stream desired with explicit parameters.
    pub fn subscribe_with(&mut self, name: &str, params: StreamParams) -> EngineResult<bool> {
        self.requirements
            .validate(name, &params)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        self.suppressed.remove(name);
        let kind = SubscriptionKind::Parameterized(params);
        let changed = self
            .subscriptions
            .get(name)
            .map_or(true, |existing| existing.kind != kind);
        self.subscriptions.insert(
            name.to_string(),
            Subscription {
                name: name.to_string(),
                kind,
            },
        );
        Ok(changed)
    }

    /// Marks an ad-hoc query stream desired, defining or replacing its query.
    pub fn subscribe_query(
        &mut self,
        name: &str,
        query_text: &str,
        namespace_filter: Option<&str>,
    ) -> EngineResult<QueryChange> {
        if self.catalog.contains_key(name) {
            return Err(EngineError::Config(format!(
                "query stream '{name}' collides with a catalog stream"
            )));
        }
        if query_text.trim().is_empty() {
            return Err(EngineError::Config(format!(
                "query stream '{name}' requires query text"
            )));
        }
        self.suppressed.remove(name);

        let query = AdHocQuery {
            name: name.to_string(),
            query_text: query_text.to_string(),
            namespace_filter: namespace_filter.map(str::to_string),
        };
        let change = match self.subscriptions.get(name).map(|s| &s.kind) {
            None => QueryChange::Added,
            Some(SubscriptionKind::Query(existing)) if *existing == query => QueryChange::Unchanged,
            Some(_) => QueryChange::Replaced,
        };
        self.subscriptions.insert(
            name.to_string(),
            Subscription {
                name: name.to_string(),
                kind: SubscriptionKind::Query(query),
            },
        );
        Ok(change)
    }

    /// Marks a stream not desired. Returns true if it was desired.
    pub fn unsubscribe(&mut self, name: &str) -> bool {
        if self.catalog.contains_key(name) {
            self.suppressed.insert(name.to_string());
        }
        self.subscriptions.remove(name).is_some()
    }

    /// Drops every subscription.
    pub fn clear(&mut self) {
        self.subscriptions.clear();
        self.suppressed.clear();
    }

    /// Returns true if `name` is desired.
    pub fn is_desired(&self, name: &str) -> bool {
        self.subscriptions.contains_key(name)
    }

    /// Names of every desired stream.
    pub fn desired_names(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    /// Activates every non-reserved catalog stream that is neither desired
    /// nor explicitly unsubscribed. Returns the newly activated names.
    pub fn auto_activate(&mut self) -> Vec<String> {
        if !self.auto_activate {
            return Vec::new();
        }
        let fresh: Vec<String> = self
            .catalog
            .keys()
            .filter(|name| {
                !self.requirements.is_excluded(name)
                    && !self.suppressed.contains(*name)
                    && !self.subscriptions.contains_key(*name)
            })
            .cloned()
            .collect();
        for name in &fresh {
            self.subscriptions.insert(
                name.clone(),
                Subscription {
                    name: name.clone(),
                    kind: SubscriptionKind::Catalog,
                },
            );
        }
        fresh
    }

    /// Channels that should exist for one desired stream.
    pub fn channel_specs_for(&self, name: &str) -> Vec<ChannelSpec> {
        let Some(sub) = self.subscriptions.get(name) else {
            return Vec::new();
        };
        match &sub.kind {
            SubscriptionKind::Query(query) => vec![self.query_spec(query)],
            SubscriptionKind::Catalog if self.requirements.is_excluded(name) => Vec::new(),
            SubscriptionKind::Catalog => self.catalog_specs(name, None),
            SubscriptionKind::Parameterized(params) => self.catalog_specs(name, Some(params)),
        }
    }

    /// Channels that should exist for every desired stream.
    pub fn all_channel_specs(&self) -> Vec<ChannelSpec> {
        self.subscriptions
            .keys()
            .flat_map(|name| self.channel_specs_for(name))
            .collect()
    }

    fn catalog_specs(&self, name: &str, params: Option<&StreamParams>) -> Vec<ChannelSpec> {
        let Some(entry) = self.catalog.get(name) else {
            return Vec::new();
        };
        if entry.namespaced {
            self.namespaces
                .iter()
                .map(|ns| self.catalog_spec(entry, Some(ns), params))
                .collect()
        } else {
            vec![self.catalog_spec(entry, None, params)]
        }
    }

    fn catalog_spec(
        &self,
        entry: &LogicalStream,
        namespace: Option<&String>,
        params: Option<&StreamParams>,
    ) -> ChannelSpec {
        let namespace = namespace.filter(|_| entry.namespaced);
        let key = ChannelKey {
            stream: entry.name.clone(),
            namespace: namespace.cloned(),
        };
        let query = params
            .map(|p| p.query.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        let accept = params.and_then(|p| p.accept.clone()).or_else(|| {
            self.requirements
                .get(&entry.name)
                .and_then(|r| r.accept.clone())
        });
        ChannelSpec {
            key,
            path: entry.path_for(namespace.map(String::as_str)),
            query,
            accept,
        }
    }

    fn query_spec(&self, query: &AdHocQuery) -> ChannelSpec {
        let mut params = vec![("query".to_string(), query.query_text.clone())];
        if let Some(filter) = &query.namespace_filter {
            params.push(("namespaces".to_string(), filter.clone()));
        }
        ChannelSpec {
            key: ChannelKey::cluster(query.name.clone()),
            path: self.query_path.clone(),
            query: params,
            accept: None,
        }
    }
}
