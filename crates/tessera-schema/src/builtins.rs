// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The synthetic `builtin` module.

use crate::module::{Data, Decl, Field, Module};
use crate::types::Type;

/// The `builtin` module present in every schema map.
///
/// It has no source directory and is never deployed; it exists so user
/// modules have a well-known root dependency and shared HTTP types.
pub fn builtins() -> Module {
    Module {
        name: "builtin".to_string(),
        comments: vec!["Built-in types shared by all modules.".to_string()],
        decls: vec![
            Decl::Data(Data {
                name: "Empty".to_string(),
                comments: vec![],
                export: true,
                fields: vec![],
            }),
            Decl::Data(Data {
                name: "HttpRequest".to_string(),
                comments: vec!["HTTP request routed through ingress.".to_string()],
                export: true,
                fields: vec![
                    Field {
                        name: "method".to_string(),
                        ty: Type::String,
                    },
                    Field {
                        name: "path".to_string(),
                        ty: Type::String,
                    },
                    Field {
                        name: "headers".to_string(),
                        ty: Type::Map {
                            key: Box::new(Type::String),
                            value: Box::new(Type::Array(Box::new(Type::String))),
                        },
                    },
                    Field {
                        name: "body".to_string(),
                        ty: Type::Bytes,
                    },
                ],
            }),
            Decl::Data(Data {
                name: "HttpResponse".to_string(),
                comments: vec![],
                export: true,
                fields: vec![
                    Field {
                        name: "status".to_string(),
                        ty: Type::Int,
                    },
                    Field {
                        name: "headers".to_string(),
                        ty: Type::Map {
                            key: Box::new(Type::String),
                            value: Box::new(Type::Array(Box::new(Type::String))),
                        },
                    },
                    Field {
                        name: "body".to_string(),
                        ty: Type::Bytes,
                    },
                ],
            }),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_have_no_imports() {
        let module = builtins();
        assert_eq!(module.name, "builtin");
        assert!(module.imports().is_empty());
    }

    #[test]
    fn builtins_are_deterministic() {
        assert_eq!(builtins().to_string(), builtins().to_string());
    }
}
