#![forbid(unsafe_code)]

use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// A secret value known to the session, redacted wherever we display user YAML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Secret {
    pub namespace: String,
    pub name: String,
    pub key: String,
    pub value: String,
}

impl Secret {
    fn placeholder(&self) -> String {
        format!("[redacted secret {}:{}:{}]", self.namespace, self.name, self.key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SecretSet {
    secrets: Vec<Secret>,
}

impl SecretSet {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, secret: Secret) {
        if secret.value.is_empty() {
            return;
        }
        self.secrets.retain(|s| !(s.namespace == secret.namespace && s.name == secret.name && s.key == secret.key));
        self.secrets.push(secret);
    }

    pub fn len(&self) -> usize { self.secrets.len() }
    pub fn is_empty(&self) -> bool { self.secrets.is_empty() }

    /// Replace every occurrence of a secret value, raw or base64-encoded.
    pub fn scrub(&self, text: &str) -> String {
        let mut out = text.to_string();
        for s in &self.secrets {
            let encoded = base64::engine::general_purpose::STANDARD.encode(s.value.as_bytes());
            out = out.replace(&encoded, &s.placeholder());
            out = out.replace(&s.value, &s.placeholder());
        }
        out
    }
}

impl FromIterator<Secret> for SecretSet {
    fn from_iter<I: IntoIterator<Item = Secret>>(iter: I) -> Self {
        let mut set = SecretSet::new();
        for s in iter { set.add(s); }
        set
    }
}
