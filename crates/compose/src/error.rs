#![forbid(unsafe_code)]

use crate::exec::Completed;

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    /// The tool ran and exited nonzero (or was killed by a signal).
    #[error("command {command:?} failed.\nexit status: {}\nstdout: {stdout:?}\nstderr: {stderr:?}", display_code(.code))]
    Exec { command: String, code: Option<i32>, stdout: String, stderr: String },
    /// The tool could not be started at all.
    #[error("running {command:?}: {source}")]
    Spawn { command: String, source: std::io::Error },
    #[error("could not parse version from output: {raw:?}")]
    VersionParse { raw: String },
    #[error("invalid version {raw:?}: {source}")]
    InvalidVersion { raw: String, source: semver::Error },
    #[error("parsing compose project {name:?}: {source}")]
    ProjectParse { name: String, raw: String, source: serde_yaml::Error },
}

impl ComposeError {
    pub(crate) fn exited(command: String, completed: &Completed) -> Self {
        ComposeError::Exec {
            command,
            code: completed.code,
            stdout: String::from_utf8_lossy(&completed.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&completed.stderr).into_owned(),
        }
    }

    /// Parse failures carry the raw input; they are never execution failures.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, ComposeError::VersionParse { .. } | ComposeError::InvalidVersion { .. } | ComposeError::ProjectParse { .. })
    }
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "terminated by signal".to_string(),
    }
}
