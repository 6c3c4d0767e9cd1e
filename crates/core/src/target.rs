//! ManifestTarget: the desired spec paired with its observed status.

#![forbid(unsafe_code)]

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Manifest, ManifestState, SecretSet};

/// Number of build records shown in the history facet.
pub const BUILD_HISTORY_DISPLAY_LIMIT: usize = 20;

/// A named chunk of text describing a target, for display collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Facet {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestTarget {
    pub manifest: Manifest,
    pub state: ManifestState,
}

impl ManifestTarget {
    pub fn new(manifest: Manifest) -> Self {
        let state = ManifestState::new(manifest.name.clone());
        Self { manifest, state }
    }

    pub fn name(&self) -> &str { &self.manifest.name }

    pub fn facets(&self, secrets: &SecretSet) -> Vec<Facet> {
        let mut out = Vec::new();

        if let Some(last) = self.state.last_build() {
            out.push(Facet { name: "Last Build Log".into(), value: last.log.clone() });
        }

        let history = self.state.build_history();
        if !history.is_empty() {
            let bases = self.manifest.local_paths();
            let mut sb = String::new();
            for br in history.iter().take(BUILD_HISTORY_DISPLAY_LIMIT) {
                sb.push_str("Build finished:\n");
                let _ = writeln!(sb, "  Reason: {}", br.reason);
                match &br.error {
                    None => sb.push_str("  Result: Success\n"),
                    Some(e) => { let _ = writeln!(sb, "  Result: {}", e); }
                }
                let _ = writeln!(sb, "  Duration: {}", display_duration(br.duration()));
                if !br.edits.is_empty() {
                    let names = file_list_display_names(&bases, &br.edits);
                    let _ = writeln!(sb, "  Changed files: {}", names.join(", "));
                }
                sb.push_str("\n\n");
            }
            out.push(Facet { name: "Build History".into(), value: sb });
        }

        if let Some(k8s) = self.manifest.k8s() {
            out.push(Facet { name: "k8s_yaml".into(), value: secrets.scrub(&k8s.yaml) });
        }

        out
    }
}

/// Render like `1h2m3.5s`, `1m30s`, `250ms`, `0s`.
pub fn display_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".into();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return format!("{}µs", decimal(nanos, 1_000));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", decimal(nanos, 1_000_000));
    }
    let total = d.as_secs();
    let (h, m) = (total / 3600, total / 60 % 60);
    let secs = decimal(u128::from(total % 60) * 1_000_000_000 + u128::from(d.subsec_nanos()), 1_000_000_000);
    match (h, m) {
        (0, 0) => format!("{secs}s"),
        (0, _) => format!("{m}m{secs}s"),
        _ => format!("{h}h{m}m{secs}s"),
    }
}

// `unit` is a power of ten; trailing fractional zeros are dropped.
fn decimal(v: u128, unit: u128) -> String {
    let (whole, rem) = (v / unit, v % unit);
    if rem == 0 {
        return whole.to_string();
    }
    let width = unit.ilog10() as usize;
    let digits = format!("{rem:0width$}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}

/// Shorten each path relative to the first base directory containing it.
pub fn file_list_display_names(bases: &[PathBuf], files: &[PathBuf]) -> Vec<String> {
    files
        .iter()
        .map(|f| {
            bases
                .iter()
                .find_map(|b| relative_to(b, f))
                .unwrap_or_else(|| f.display().to_string())
        })
        .collect()
}

fn relative_to(base: &Path, file: &Path) -> Option<String> {
    let rel = file.strip_prefix(base).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    Some(rel.display().to_string())
}
