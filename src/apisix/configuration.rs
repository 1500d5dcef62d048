//! In-memory snapshot of a proxy configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::apisix::resource::{ApisixResource, PluginMetadata, Route, Service, Ssl};

/// Routes, services, SSLs and plugin metadata keyed by resource ID.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApisixConfiguration {
    pub routes: HashMap<String, Route>,
    pub services: HashMap<String, Service>,
    pub ssls: HashMap<String, Ssl>,
    pub plugin_metadata: HashMap<String, PluginMetadata>,
}

/// Resource counts of one configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationStatistic {
    pub routes: usize,
    pub services: usize,
    pub ssls: usize,
    pub plugin_metadata: usize,
}

impl ConfigurationStatistic {
    pub fn total(&self) -> usize {
        self.routes + self.services + self.ssls + self.plugin_metadata
    }
}

impl ApisixConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a resource under its own ID, replacing any previous entry.
    pub fn insert<R: ApisixResource>(&mut self, resource: R) {
        R::select_mut(self).insert(resource.id().to_string(), resource);
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
            && self.services.is_empty()
            && self.ssls.is_empty()
            && self.plugin_metadata.is_empty()
    }

    pub fn statistic(&self) -> ConfigurationStatistic {
        ConfigurationStatistic {
            routes: self.routes.len(),
            services: self.services.len(),
            ssls: self.ssls.len(),
            plugin_metadata: self.plugin_metadata.len(),
        }
    }

    /// Merge `other` into `self`; entries of `other` win on ID collision.
    pub fn merge(&mut self, other: ApisixConfiguration) {
        self.routes.extend(other.routes);
        self.services.extend(other.services);
        self.ssls.extend(other.ssls);
        self.plugin_metadata.extend(other.plugin_metadata);
    }

    /// Copy out the resources belonging to `stage_key`.
    pub fn extract_stage(&self, stage_key: &str) -> ApisixConfiguration {
        ApisixConfiguration {
            routes: filter_stage(&self.routes, stage_key),
            services: filter_stage(&self.services, stage_key),
            ssls: filter_stage(&self.ssls, stage_key),
            plugin_metadata: filter_stage(&self.plugin_metadata, stage_key),
        }
    }

    /// Split into one configuration per stage key.
    pub fn group_by_stage(self) -> HashMap<String, ApisixConfiguration> {
        let mut staged: HashMap<String, ApisixConfiguration> = HashMap::new();
        group_into(&mut staged, self.routes);
        group_into(&mut staged, self.services);
        group_into(&mut staged, self.ssls);
        group_into(&mut staged, self.plugin_metadata);
        staged
    }
}

fn filter_stage<R: ApisixResource>(
    resources: &HashMap<String, R>,
    stage_key: &str,
) -> HashMap<String, R> {
    resources
        .iter()
        .filter(|(_, resource)| resource.stage_key() == stage_key)
        .map(|(id, resource)| (id.clone(), resource.clone()))
        .collect()
}

fn group_into<R: ApisixResource>(
    staged: &mut HashMap<String, ApisixConfiguration>,
    resources: HashMap<String, R>,
) {
    for (id, resource) in resources {
        let config = staged.entry(resource.stage_key()).or_default();
        R::select_mut(config).insert(id, resource);
    }
}
