#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::ComposeError;

/// The fully-resolved project as printed by `docker-compose config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub build: Option<Value>,
    #[serde(default)]
    pub ports: Vec<Value>,
    #[serde(default)]
    pub depends_on: Option<Value>,
    #[serde(default)]
    pub labels: Option<Value>,
}

impl ServiceConfig {
    /// Host ports this service publishes. Accepts both the short form
    /// (`"8080:80/tcp"`) and the long form (`{published: "8080", target: 80}`).
    pub fn published_ports(&self) -> Vec<u16> {
        let mut out: Vec<u16> = self.ports.iter().filter_map(published_port).collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

fn published_port(v: &Value) -> Option<u16> {
    match v {
        Value::Mapping(m) => match m.get("published")? {
            Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            Value::String(s) => s.parse().ok(),
            _ => None,
        },
        Value::String(s) => {
            // [ip:]host:container[/proto]; a bare container port publishes nothing fixed
            let no_proto = s.split('/').next()?;
            let mut parts = no_proto.rsplitn(3, ':');
            let _container = parts.next()?;
            parts.next()?.parse().ok()
        }
        _ => None,
    }
}

impl Project {
    pub fn service_names(&self) -> Vec<&str> { self.services.keys().map(String::as_str).collect() }
}

/// Parse `config` output. A missing top-level name (v1 output) falls back to `fallback_name`.
pub fn parse_project(raw: &str, fallback_name: &str) -> Result<Project, ComposeError> {
    let mut project: Project = serde_yaml::from_str(raw).map_err(|source| ComposeError::ProjectParse {
        name: fallback_name.to_string(),
        raw: raw.to_string(),
        source,
    })?;
    if project.name.is_empty() {
        project.name = fallback_name.to_string();
    }
    Ok(project)
}
