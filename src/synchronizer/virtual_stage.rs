//! Built-in stage owned by the synchronizer itself.
//!
//! # Responsibilities
//! - Catch-all 404 route at the lowest priority
//! - Rate-limited health-check route
//! - Optional extra routes, services and SSLs from a static YAML file
//!
//! Every resource carries the reserved virtual gateway/stage labels, so it is
//! never mistaken for a user stage and never removed as a stale one.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::json;

use crate::apisix::{
    build_stage_key, ApisixConfiguration, Labels, Plugins, Route, Service, Ssl, GATEWAY_LABEL,
    STAGE_LABEL,
};
use crate::config::schema::VirtualStageConfig;

/// Extra resources file layout.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExtraResources {
    routes: Vec<Route>,
    services: Vec<Service>,
    ssls: Vec<Ssl>,
}

/// Builder of the virtual stage configuration.
#[derive(Debug, Clone)]
pub struct VirtualStage {
    pub gateway_name: String,
    pub stage_name: String,
    pub extra_resources_path: Option<PathBuf>,
    pub health_check_path: String,
    /// Requests per second admitted to the health-check route.
    pub health_check_rate: u32,
    pub not_found_priority: i64,
}

impl Default for VirtualStage {
    fn default() -> Self {
        Self::from(&VirtualStageConfig::default())
    }
}

impl From<&VirtualStageConfig> for VirtualStage {
    fn from(config: &VirtualStageConfig) -> Self {
        Self {
            gateway_name: config.gateway_name.clone(),
            stage_name: config.stage_name.clone(),
            extra_resources_path: config.extra_resources_path.clone(),
            health_check_path: config.health_check_path.clone(),
            health_check_rate: config.health_check_rate,
            not_found_priority: config.not_found_priority,
        }
    }
}

impl VirtualStage {
    pub fn stage_key(&self) -> String {
        build_stage_key(&self.gateway_name, &self.stage_name)
    }

    fn labels(&self) -> Labels {
        Labels::from([
            (GATEWAY_LABEL.to_string(), self.gateway_name.clone()),
            (STAGE_LABEL.to_string(), self.stage_name.clone()),
        ])
    }

    fn resource_id(&self, name: &str) -> String {
        format!("{}.{}.{}", self.gateway_name, self.stage_name, name)
    }

    /// Assemble the full virtual stage configuration.
    pub fn make_configuration(&self) -> ApisixConfiguration {
        let mut config = ApisixConfiguration::new();
        config.insert(self.not_found_route());
        config.insert(self.health_check_route());

        let extra = self.load_extra_resources();
        let labels = self.labels();
        for mut route in extra.routes.into_iter().filter(|r| !r.id.is_empty()) {
            route.labels.extend(labels.clone());
            config.insert(route);
        }
        for mut service in extra.services.into_iter().filter(|s| !s.id.is_empty()) {
            service.labels.extend(labels.clone());
            config.insert(service);
        }
        for mut ssl in extra.ssls.into_iter().filter(|s| !s.id.is_empty()) {
            ssl.labels.extend(labels.clone());
            config.insert(ssl);
        }
        config
    }

    fn not_found_route(&self) -> Route {
        Route {
            id: self.resource_id("not-found"),
            name: "not-found".to_string(),
            labels: self.labels(),
            uris: vec!["/*".to_string()],
            priority: self.not_found_priority,
            plugins: plugins(json!({
                "mocking": {
                    "response_status": 404,
                    "content_type": "application/json",
                    "response_example": "{\"code\":\"NOT_FOUND\",\"message\":\"no route matched\"}",
                }
            })),
            ..Default::default()
        }
    }

    fn health_check_route(&self) -> Route {
        Route {
            id: self.resource_id("healthz"),
            name: "healthz".to_string(),
            labels: self.labels(),
            uris: vec![self.health_check_path.clone()],
            methods: vec!["GET".to_string()],
            plugins: plugins(json!({
                "limit-req": {
                    "rate": self.health_check_rate,
                    "burst": self.health_check_rate,
                    "key": "server_addr",
                    "rejected_code": 429,
                },
                "mocking": {
                    "response_status": 200,
                    "content_type": "text/plain",
                    "response_example": "ok",
                }
            })),
            ..Default::default()
        }
    }

    fn load_extra_resources(&self) -> ExtraResources {
        let Some(path) = &self.extra_resources_path else {
            return ExtraResources::default();
        };
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Extra resources file unreadable");
                return ExtraResources::default();
            }
        };
        if content.trim().is_empty() {
            return ExtraResources::default();
        }
        match serde_yaml::from_str(&content) {
            Ok(extra) => extra,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Extra resources file invalid");
                ExtraResources::default()
            }
        }
    }
}

fn plugins(value: serde_json::Value) -> Plugins {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Plugins::new(),
    }
}
