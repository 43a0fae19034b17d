// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Key formats for persisted entities.

use std::fmt;
use std::str::FromStr;

use rand::Rng;

const SUFFIX_LEN: usize = 10;
const SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A random lowercase-alphanumeric suffix for entity keys.
pub fn new_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}

/// A deployment key: `<module>-<suffix>`.
///
/// The module name may itself contain dashes; the suffix never does, so
/// parsing splits on the last dash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeploymentKey {
    pub module: String,
    pub suffix: String,
}

impl DeploymentKey {
    pub fn generate(module: &str) -> Self {
        Self {
            module: module.to_string(),
            suffix: new_suffix(),
        }
    }
}

impl fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.module, self.suffix)
    }
}

/// Error parsing a deployment key.
#[derive(Debug, thiserror::Error)]
#[error("invalid deployment key {0:?}")]
pub struct DeploymentKeyParseError(pub String);

impl FromStr for DeploymentKey {
    type Err = DeploymentKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('-') {
            Some((module, suffix))
                if !module.is_empty()
                    && !suffix.is_empty()
                    && suffix.bytes().all(|b| SUFFIX_ALPHABET.contains(&b)) =>
            {
                Ok(Self {
                    module: module.to_string(),
                    suffix: suffix.to_string(),
                })
            }
            _ => Err(DeploymentKeyParseError(s.to_string())),
        }
    }
}

/// A lease key: `/system/<kind>/<id>[:<uuid>]`.
pub fn lease_key(kind: &str, parts: &[&str]) -> String {
    format!("/system/{}/{}", kind, parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffixes_are_unique_enough() {
        let a = new_suffix();
        let b = new_suffix();
        assert_eq!(a.len(), SUFFIX_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn deployment_key_round_trip() {
        let key = DeploymentKey::generate("time");
        let parsed: DeploymentKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn deployment_key_with_dashed_module() {
        let parsed: DeploymentKey = "my-module-0123456789".parse().unwrap();
        assert_eq!(parsed.module, "my-module");
        assert_eq!(parsed.suffix, "0123456789");
    }

    #[test]
    fn malformed_deployment_keys_rejected() {
        assert!("nodash".parse::<DeploymentKey>().is_err());
        assert!("-suffixonly".parse::<DeploymentKey>().is_err());
        assert!("module-".parse::<DeploymentKey>().is_err());
        assert!("module-UPPER".parse::<DeploymentKey>().is_err());
    }

    #[test]
    fn lease_key_format() {
        assert_eq!(
            lease_key("fsm_instance", &["test.test", "invoiceID"]),
            "/system/fsm_instance/test.test/invoiceID"
        );
    }
}
