//! `drydock.yaml` loading.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use drydock_core::{ConfigError, Manifest, Secret, SecretSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ManifestFile {
    #[serde(default)]
    pub manifests: Vec<Manifest>,
    #[serde(default)]
    pub secrets: Vec<Secret>,
}

/// Validated file contents. Every problem found is kept in `errors`; only manifests that
/// cannot be addressed at all (no name, duplicate name, no service) are left out.
#[derive(Debug, Default)]
pub struct Loaded {
    pub manifests: Vec<Manifest>,
    pub secrets: SecretSet,
    pub errors: Vec<(String, ConfigError)>,
}

pub fn load(path: &Path) -> Result<Loaded> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse(raw: &str) -> Result<Loaded> {
    let file: ManifestFile = serde_yaml::from_str(raw)?;
    Ok(validate(file))
}

pub fn validate(file: ManifestFile) -> Loaded {
    let mut out = Loaded { secrets: file.secrets.into_iter().collect(), ..Default::default() };
    let mut seen = HashSet::new();
    for m in file.manifests {
        match m.validate() {
            Ok(()) => {}
            // still deployed; the forward controller reports it on the target
            Err(e @ (ConfigError::DuplicateLocalPort(_) | ConfigError::ZeroLocalPort)) => out.errors.push((m.name.clone(), e)),
            Err(e) => {
                out.errors.push((m.name.clone(), e));
                continue;
            }
        }
        if !seen.insert(m.name.clone()) {
            out.errors.push((m.name.clone(), ConfigError::DuplicateManifest(m.name.clone())));
            continue;
        }
        out.manifests.push(m);
    }
    out
}
