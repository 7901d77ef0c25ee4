//! Reserved streams and their required parameters.
//!
//! Some stream names cannot be opened without extra information (a summary
//! size, a file path, query text). The registry never opens them on its own;
//! they are only opened through a parameterized subscription that passes
//! [`StreamRequirements::validate`].

use crate::error::{ProtocolError, ProtocolResult};
use std::collections::{BTreeMap, HashMap};

/// Parameters for an explicit subscription.
///
/// Parameters are sent as query-string pairs on the data channel request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamParams {
    /// Query-string parameters.
    pub query: BTreeMap<String, String>,
    /// `Accept` header override.
    pub accept: Option<String>,
}

impl StreamParams {
    /// Creates an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a query parameter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Overrides the `Accept` header.
    pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }

    /// Returns a parameter value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }
}

/// What a reserved stream needs before it can be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequirement {
    /// Query parameters that must be present and non-empty.
    pub params: Vec<String>,
    /// `Accept` header used when the subscription does not override it.
    pub accept: Option<String>,
}

impl StreamRequirement {
    /// Creates a requirement on the given parameters.
    pub fn params<I, S>(params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            params: params.into_iter().map(Into::into).collect(),
            accept: None,
        }
    }

    /// Sets the default `Accept` header.
    pub fn with_accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }
}

/// Table of reserved stream names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequirements {
    entries: HashMap<String, StreamRequirement>,
}

impl StreamRequirements {
    /// Creates an empty table.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Adds or replaces an entry.
    pub fn with(mut self, name: impl Into<String>, requirement: StreamRequirement) -> Self {
        self.entries.insert(name.into(), requirement);
        self
    }

    /// Returns true if `name` must never be opened automatically.
    pub fn is_excluded(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Returns the requirement for `name`, if reserved.
    pub fn get(&self, name: &str) -> Option<&StreamRequirement> {
        self.entries.get(name)
    }

    /// Checks that `params` satisfy the requirement for `name`.
    ///
    /// Names that are not reserved always pass.
    pub fn validate(&self, name: &str, params: &StreamParams) -> ProtocolResult<()> {
        let Some(requirement) = self.entries.get(name) else {
            return Ok(());
        };
        for param in &requirement.params {
            let present = params.get(param).is_some_and(|v| !v.trim().is_empty());
            if !present {
                return Err(ProtocolError::MissingParameter {
                    stream: name.to_string(),
                    param: param.clone(),
                });
            }
        }
        Ok(())
    }
}

impl Default for StreamRequirements {
    fn default() -> Self {
        Self::empty()
            .with("summary", StreamRequirement::params(["size"]))
            .with(
                "file",
                StreamRequirement::params(["path"]).with_accept("application/octet-stream"),
            )
            .with("eql", StreamRequirement::params(["query"]))
            .with("nql", StreamRequirement::params(["query"]))
    }
}
