//! Desired spec: what the user declared for each workload.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// A local-to-container port mapping. `container_port: None` means "discover it from the pod".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct PortForward {
    pub local_port: u16,
    #[serde(default, deserialize_with = "zero_is_none")]
    pub container_port: Option<u16>,
}

impl PortForward {
    pub fn local(local_port: u16) -> Self { Self { local_port, container_port: None } }

    pub fn explicit(local_port: u16, container_port: u16) -> Self {
        Self { local_port, container_port: Some(container_port) }
    }
}

// Manifest files written for other tools use `container_port: 0` for auto-discovery.
fn zero_is_none<'de, D>(d: D) -> Result<Option<u16>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let v = Option::<u16>::deserialize(d)?;
    Ok(v.filter(|p| *p != 0))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct K8sTarget {
    /// Raw deployment YAML as applied to the cluster.
    #[serde(default)]
    pub yaml: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub port_forwards: Vec<PortForward>,
}

fn default_namespace() -> String { "default".to_string() }

impl K8sTarget {
    /// Reject forward specs that can never be satisfied together.
    pub fn validate_port_forwards(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for pf in &self.port_forwards {
            if pf.local_port == 0 {
                return Err(ConfigError::ZeroLocalPort);
            }
            if !seen.insert(pf.local_port) {
                return Err(ConfigError::DuplicateLocalPort(pf.local_port));
            }
        }
        Ok(())
    }
}

/// Everything the compose CLI needs to address a project. Passed whole on every invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ComposeProjectSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub project_path: Option<PathBuf>,
    #[serde(default)]
    pub config_paths: Vec<PathBuf>,
    /// Inline compose YAML, fed on stdin with `-f -`.
    #[serde(default)]
    pub yaml: String,
    #[serde(default)]
    pub env_file: Option<PathBuf>,
}

/// One service within a compose project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ComposeService {
    pub project: ComposeProjectSpec,
    pub service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DockerComposeTarget {
    pub project: ComposeProjectSpec,
    pub service: String,
}

impl DockerComposeTarget {
    pub fn service_spec(&self) -> ComposeService {
        ComposeService { project: self.project.clone(), service: self.service.clone() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LocalTarget {
    pub cmd: String,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

/// Tagged by `type:` in manifest files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeployTarget {
    Kubernetes(K8sTarget),
    DockerCompose(DockerComposeTarget),
    Local(LocalTarget),
}

/// An image to build before deploying.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageTarget {
    pub image_ref: String,
    pub context: PathBuf,
}

/// Immutable desired spec for one workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub name: String,
    pub deploy: DeployTarget,
    #[serde(default)]
    pub builds: Vec<ImageTarget>,
}

impl Manifest {
    pub fn new(name: impl Into<String>, deploy: DeployTarget) -> Self {
        Self { name: name.into(), deploy, builds: Vec::new() }
    }

    pub fn with_build(mut self, image: ImageTarget) -> Self {
        self.builds.push(image);
        self
    }

    pub fn k8s(&self) -> Option<&K8sTarget> {
        match &self.deploy { DeployTarget::Kubernetes(k) => Some(k), _ => None }
    }

    pub fn compose(&self) -> Option<&DockerComposeTarget> {
        match &self.deploy { DeployTarget::DockerCompose(d) => Some(d), _ => None }
    }

    pub fn is_k8s(&self) -> bool { self.k8s().is_some() }

    /// Directories this manifest watches; used to shorten changed-file names.
    pub fn local_paths(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self.builds.iter().map(|b| b.context.clone()).collect();
        match &self.deploy {
            DeployTarget::DockerCompose(dc) => {
                if let Some(p) = &dc.project.project_path { out.push(p.clone()); }
            }
            DeployTarget::Local(l) => {
                if let Some(p) = &l.workdir { out.push(p.clone()); }
            }
            DeployTarget::Kubernetes(_) => {}
        }
        out
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyName);
        }
        match &self.deploy {
            DeployTarget::Kubernetes(k) => k.validate_port_forwards(),
            DeployTarget::DockerCompose(dc) if dc.service.is_empty() => {
                Err(ConfigError::MissingService(self.name.clone()))
            }
            _ => Ok(()),
        }
    }
}
