#![forbid(unsafe_code)]

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ComposeError;

// Covers v1 (`docker-compose version 1.29.2, build 5becea4c`) and the v2 variants
// (`Docker Compose version v2.0.0-rc.3`, `docker compose version: 2.2.3`).
static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^docker[ -]compose(?: version)?:? v?([^\s,]+),?(?: build ([a-z0-9-]+))?").expect("version regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeVersion {
    /// `vMAJOR.MINOR.PATCH[-PRERELEASE]`, build metadata stripped.
    pub canonical: String,
    /// Build identifier, possibly empty.
    pub build: String,
    pub semver: semver::Version,
}

impl ComposeVersion {
    pub fn is_v2_or_newer(&self) -> bool { self.semver.major >= 2 }
}

/// Extract the tool version from `docker-compose version` output.
pub fn parse_version_output(stdout: &[u8]) -> Result<ComposeVersion, ComposeError> {
    let text = String::from_utf8_lossy(stdout);
    let caps = VERSION_RE
        .captures(text.trim())
        .ok_or_else(|| ComposeError::VersionParse { raw: text.to_string() })?;
    let raw = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    let semver = parse_lenient(raw).map_err(|source| ComposeError::InvalidVersion { raw: format!("v{raw}"), source })?;

    let mut canonical = format!("v{}.{}.{}", semver.major, semver.minor, semver.patch);
    if !semver.pre.is_empty() {
        canonical.push('-');
        canonical.push_str(semver.pre.as_str());
    }
    let build = if !semver.build.is_empty() {
        semver.build.as_str().to_string()
    } else {
        caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default()
    };
    Ok(ComposeVersion { canonical, build, semver })
}

// `2` and `2.1` are accepted and padded; a prerelease or build suffix needs all three parts.
fn parse_lenient(raw: &str) -> Result<semver::Version, semver::Error> {
    let has_suffix = raw.contains(['-', '+']);
    let dots = raw.matches('.').count();
    if has_suffix || dots >= 2 {
        return semver::Version::parse(raw);
    }
    let padded = match dots {
        0 => format!("{raw}.0.0"),
        _ => format!("{raw}.0"),
    };
    semver::Version::parse(&padded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> (String, String) {
        let v = parse_version_output(s.as_bytes()).expect("parse");
        (v.canonical, v.build)
    }

    #[test]
    fn v1_output() {
        let out = "docker-compose version 1.29.2, build 5becea4c\n\
                   docker-py version: 5.0.0\n\
                   CPython version: 3.7.10\n\
                   OpenSSL version: OpenSSL 1.1.0l  10 Sep 2019\n";
        assert_eq!(parse(out), ("v1.29.2".into(), "5becea4c".into()));
    }

    #[test]
    fn v2_outputs() {
        assert_eq!(parse("Docker Compose version v2.0.0-rc.3\n"), ("v2.0.0-rc.3".into(), String::new()));
        assert_eq!(parse("Docker Compose version 2.2.3"), ("v2.2.3".into(), String::new()));
        assert_eq!(parse("docker compose version: v2.1.1"), ("v2.1.1".into(), String::new()));
        assert_eq!(parse("Docker Compose version v2.0.0-beta.6+zeta"), ("v2.0.0-beta.6".into(), "zeta".into()));
    }

    #[test]
    fn short_versions_are_padded() {
        let v = parse_version_output(b"Docker Compose version v2").expect("parse");
        assert_eq!(v.canonical, "v2.0.0");
        assert!(v.is_v2_or_newer());
        assert_eq!(parse("docker-compose version 1.27, build abc-1"), ("v1.27.0".into(), "abc-1".into()));
    }

    #[test]
    fn unrecognized_output_is_error() {
        let err = parse_version_output(b"podman version 4.0.0").expect_err("no match");
        assert!(matches!(err, ComposeError::VersionParse { .. }));
        assert!(err.is_parse_error());
    }

    #[test]
    fn invalid_version_is_error() {
        let err = parse_version_output(b"Docker Compose version vfoo").expect_err("not semver");
        match err {
            ComposeError::InvalidVersion { raw, .. } => assert_eq!(raw, "vfoo"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
