// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-module references.

use std::fmt;
use std::str::FromStr;

/// A reference to a named declaration in a module, rendered `module.name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Ref {
    pub module: String,
    pub name: String,
}

impl Ref {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// Error parsing a `module.name` reference.
#[derive(Debug, thiserror::Error)]
#[error("invalid reference {0:?}, expected \"module.name\"")]
pub struct RefParseError(pub String);

impl FromStr for Ref {
    type Err = RefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((module, name)) if !module.is_empty() && !name.is_empty() && !name.contains('.') => {
                Ok(Ref::new(module, name))
            }
            _ => Err(RefParseError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip() {
        let r: Ref = "billing.invoice".parse().unwrap();
        assert_eq!(r, Ref::new("billing", "invoice"));
        assert_eq!(r.to_string(), "billing.invoice");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("noseparator".parse::<Ref>().is_err());
        assert!(".name".parse::<Ref>().is_err());
        assert!("module.".parse::<Ref>().is_err());
        assert!("a.b.c".parse::<Ref>().is_err());
    }
}
