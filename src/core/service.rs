use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

use crate::config::DownstreamHostAndPort;

/// Network address of one downstream service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceHostAndPort {
    pub host: String,
    pub port: u16,
    /// Scheme advertised by the registry; the route's scheme is used when absent
    #[serde(default)]
    pub scheme: Option<String>,
}

impl ServiceHostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            scheme: None,
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }
}

impl fmt::Display for ServiceHostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<&DownstreamHostAndPort> for ServiceHostAndPort {
    fn from(address: &DownstreamHostAndPort) -> Self {
        Self::new(address.host.clone(), address.port)
    }
}

/// A resolved downstream instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    pub id: String,
    pub host_and_port: ServiceHostAndPort,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl ServiceInstance {
    pub fn new(name: impl Into<String>, host_and_port: ServiceHostAndPort) -> Self {
        let name = name.into();
        Self {
            id: format!("{name}@{host_and_port}"),
            name,
            host_and_port,
            version: String::new(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}
