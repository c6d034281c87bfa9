//! Site, cloud and nucleus topology.
//!
//! The watchdog resolves where a task's outputs must go from this snapshot.
//! [`StaticTopology`] loads it from a JSON file at startup.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;

/// A compute/storage site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteSpec {
    pub name: String,
    /// Endpoint used when no storage token matches.
    pub default_endpoint: String,
    /// Storage token -> DDM endpoint.
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
}

impl SiteSpec {
    pub fn endpoint(&self, token: Option<&str>) -> &str {
        token
            .and_then(|t| self.endpoints.get(t))
            .map_or(self.default_endpoint.as_str(), String::as_str)
    }
}

/// A cloud in the cloud model; outputs go to its source site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudSpec {
    pub name: String,
    pub source_site: String,
}

/// A nucleus in the WORLD model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NucleusSpec {
    pub name: String,
    #[serde(default)]
    pub sites: Vec<String>,
    pub default_endpoint: String,
    /// Storage token -> associated DDM endpoint.
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
}

impl NucleusSpec {
    /// Endpoint associated with a storage token, falling back to the default.
    pub fn associated_endpoint(&self, token: Option<&str>) -> &str {
        token
            .and_then(|t| self.endpoints.get(t))
            .map_or(self.default_endpoint.as_str(), String::as_str)
    }
}

/// Read-only topology lookups.
pub trait SiteMapper: Send + Sync {
    fn cloud(&self, name: &str) -> Option<&CloudSpec>;

    fn nucleus(&self, name: &str) -> Option<&NucleusSpec>;

    fn site(&self, name: &str) -> Option<&SiteSpec>;

    fn cloud_exists(&self, name: &str) -> bool {
        self.cloud(name).is_some()
    }

    /// DDM endpoint of a site for a storage token.
    fn ddm_endpoint(&self, site: &str, token: Option<&str>) -> Option<String> {
        self.site(site).map(|s| s.endpoint(token).to_string())
    }

    /// Where outputs of a cloud-model task are subscribed.
    fn cloud_destination(&self, cloud: &str, token: Option<&str>) -> Option<String> {
        let cloud = self.cloud(cloud)?;
        self.ddm_endpoint(&cloud.source_site, token)
    }
}

#[derive(Debug, Default, Deserialize)]
struct TopologyFile {
    #[serde(default)]
    clouds: Vec<CloudSpec>,
    #[serde(default)]
    nuclei: Vec<NucleusSpec>,
    #[serde(default)]
    sites: Vec<SiteSpec>,
}

/// Topology held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticTopology {
    clouds: HashMap<String, CloudSpec>,
    nuclei: HashMap<String, NucleusSpec>,
    sites: HashMap<String, SiteSpec>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cloud(mut self, cloud: CloudSpec) -> Self {
        self.clouds.insert(cloud.name.clone(), cloud);
        self
    }

    pub fn with_nucleus(mut self, nucleus: NucleusSpec) -> Self {
        self.nuclei.insert(nucleus.name.clone(), nucleus);
        self
    }

    pub fn with_site(mut self, site: SiteSpec) -> Self {
        self.sites.insert(site.name.clone(), site);
        self
    }

    /// Parse and validate a JSON topology document.
    pub fn from_json_str(json: &str) -> Result<Self, TopologyError> {
        let file: TopologyFile = serde_json::from_str(json)?;
        let mut topology = Self::new();
        for site in file.sites {
            topology = topology.with_site(site);
        }
        for cloud in file.clouds {
            topology = topology.with_cloud(cloud);
        }
        for nucleus in file.nuclei {
            if let Some(missing) = nucleus.sites.iter().find(|s| !topology.sites.contains_key(*s)) {
                return Err(TopologyError::UnknownSite {
                    nucleus: nucleus.name.clone(),
                    site: missing.clone(),
                });
            }
            topology = topology.with_nucleus(nucleus);
        }
        Ok(topology)
    }

    pub fn load(path: &Path) -> Result<Self, TopologyError> {
        let json = std::fs::read_to_string(path)?;
        let topology = Self::from_json_str(&json)?;
        tracing::info!(
            path = %path.display(),
            clouds = topology.clouds.len(),
            nuclei = topology.nuclei.len(),
            sites = topology.sites.len(),
            "Loaded topology"
        );
        Ok(topology)
    }
}

impl SiteMapper for StaticTopology {
    fn cloud(&self, name: &str) -> Option<&CloudSpec> {
        self.clouds.get(name)
    }

    fn nucleus(&self, name: &str) -> Option<&NucleusSpec> {
        self.nuclei.get(name)
    }

    fn site(&self, name: &str) -> Option<&SiteSpec> {
        self.sites.get(name)
    }
}
