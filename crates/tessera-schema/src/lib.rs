// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tessera Schema - canonical module schema model
//!
//! Every module deployed through tessera carries a schema describing its
//! exported types, verbs, topics, subscriptions and state machines. The
//! controller persists schemas as JSON blobs; the build engine compares them
//! by hashing their canonical text form.
//!
//! Two representations matter:
//!
//! - The serde JSON form, used for persistence and the wire.
//! - The `Display` text form, which is deterministic: two structurally equal
//!   schemas always render byte-identical text. [`module_hash`] is SHA-256
//!   over that text and is the identity used for change detection.
//!
//! All polymorphic nodes ([`Type`], [`Decl`], [`EnumVariants`]) are sum types
//! matched exhaustively. Cross-module references are by name ([`Ref`]), never
//! by owning pointers, so self-referential data types are representable.

mod builtins;
mod module;
mod refs;
mod retry;
mod types;

pub use builtins::builtins;
pub use module::{
    Data, Decl, EnumDecl, EnumVariants, Field, Fsm, FsmTransition, IngressSpec, Module,
    Subscription, Topic, TypeVariant, ValueVariant, Verb,
};
pub use refs::{Ref, RefParseError};
pub use retry::RetryParams;
pub use types::Type;

use sha2::{Digest, Sha256};

/// A complete schema: the set of module schemas known to one process.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Schema {
    pub modules: Vec<Module>,
}

impl Schema {
    /// Look up a module by name.
    pub fn module(&self, name: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.name == name)
    }
}

impl std::fmt::Display for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, module) in self.modules.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{module}")?;
        }
        Ok(())
    }
}

/// SHA-256 over the module's canonical text form.
///
/// Structurally equal modules hash equal; this is the identity the build
/// engine uses to suppress rebuilds triggered by its own deploys.
pub fn module_hash(module: &Module) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(module.to_string().as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_module() -> Module {
        Module {
            name: "echo".to_string(),
            comments: vec!["Echo service.".to_string()],
            decls: vec![
                Decl::Data(Data {
                    name: "EchoRequest".to_string(),
                    comments: vec![],
                    export: true,
                    fields: vec![Field {
                        name: "name".to_string(),
                        ty: Type::Optional(Box::new(Type::String)),
                    }],
                }),
                Decl::Data(Data {
                    name: "EchoResponse".to_string(),
                    comments: vec![],
                    export: true,
                    fields: vec![Field {
                        name: "message".to_string(),
                        ty: Type::String,
                    }],
                }),
                Decl::Verb(Verb {
                    name: "echo".to_string(),
                    comments: vec![],
                    export: true,
                    request: Type::Ref(Ref::new("echo", "EchoRequest")),
                    response: Type::Ref(Ref::new("echo", "EchoResponse")),
                    cron: None,
                    ingress: None,
                }),
            ],
        }
    }

    #[test]
    fn display_is_stable() {
        let a = sample_module();
        let b = sample_module();
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(module_hash(&a), module_hash(&b));
    }

    #[test]
    fn hash_changes_with_content() {
        let a = sample_module();
        let mut b = sample_module();
        b.decls.push(Decl::Verb(Verb {
            name: "extra".to_string(),
            comments: vec![],
            export: false,
            request: Type::Unit,
            response: Type::Unit,
            cron: None,
            ingress: None,
        }));
        assert_ne!(module_hash(&a), module_hash(&b));
    }

    #[test]
    fn json_round_trip() {
        let module = sample_module();
        let json = serde_json::to_string(&module).unwrap();
        let back: Module = serde_json::from_str(&json).unwrap();
        assert_eq!(module, back);
        assert_eq!(module.to_string(), back.to_string());
    }

    #[test]
    fn schema_lookup() {
        let schema = Schema {
            modules: vec![builtins(), sample_module()],
        };
        assert!(schema.module("builtin").is_some());
        assert!(schema.module("echo").is_some());
        assert!(schema.module("missing").is_none());
    }
}
