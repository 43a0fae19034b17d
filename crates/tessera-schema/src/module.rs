// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Module schemas and their declarations.

use std::fmt;

use crate::refs::Ref;
use crate::types::Type;

/// The schema of one module: its name and exported declarations.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    #[serde(default)]
    pub decls: Vec<Decl>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            comments: vec![],
            decls: vec![],
        }
    }

    /// Names of foreign modules referenced anywhere in this module's
    /// declarations, sorted and deduplicated.
    pub fn imports(&self) -> Vec<String> {
        let mut out = Vec::new();
        for decl in &self.decls {
            match decl {
                Decl::Data(d) => {
                    for field in &d.fields {
                        field.ty.collect_imports(&self.name, &mut out);
                    }
                }
                Decl::Verb(v) => {
                    v.request.collect_imports(&self.name, &mut out);
                    v.response.collect_imports(&self.name, &mut out);
                }
                Decl::Enum(e) => match &e.variants {
                    EnumVariants::Value { ty, .. } => ty.collect_imports(&self.name, &mut out),
                    EnumVariants::Type(variants) => {
                        for v in variants {
                            v.ty.collect_imports(&self.name, &mut out);
                        }
                    }
                },
                Decl::Topic(t) => t.event.collect_imports(&self.name, &mut out),
                Decl::Subscription(s) => {
                    if s.topic.module != self.name {
                        out.push(s.topic.module.clone());
                    }
                }
                Decl::Fsm(fsm) => {
                    for r in fsm
                        .start
                        .iter()
                        .chain(fsm.transitions.iter().flat_map(|t| {
                            t.from.iter().chain(std::iter::once(&t.to))
                        }))
                    {
                        if r.module != self.name {
                            out.push(r.module.clone());
                        }
                    }
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Look up a verb declaration by name.
    pub fn verb(&self, name: &str) -> Option<&Verb> {
        self.decls.iter().find_map(|d| match d {
            Decl::Verb(v) if v.name == name => Some(v),
            _ => None,
        })
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_comments(f, "", &self.comments)?;
        writeln!(f, "module {} {{", self.name)?;
        for decl in &self.decls {
            write!(f, "{decl}")?;
        }
        writeln!(f, "}}")
    }
}

/// A top-level declaration in a module.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "decl", rename_all = "snake_case")]
pub enum Decl {
    Data(Data),
    Verb(Verb),
    Enum(EnumDecl),
    Topic(Topic),
    Subscription(Subscription),
    Fsm(Fsm),
}

impl fmt::Display for Decl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decl::Data(d) => write!(f, "{d}"),
            Decl::Verb(v) => write!(f, "{v}"),
            Decl::Enum(e) => write!(f, "{e}"),
            Decl::Topic(t) => write!(f, "{t}"),
            Decl::Subscription(s) => write!(f, "{s}"),
            Decl::Fsm(m) => write!(f, "{m}"),
        }
    }
}

/// A structured data type.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Data {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    #[serde(default)]
    pub export: bool,
    #[serde(default)]
    pub fields: Vec<Field>,
}

/// One field of a [`Data`] declaration.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Type,
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_comments(f, "  ", &self.comments)?;
        write!(f, "  {}data {}", export_prefix(self.export), self.name)?;
        if self.fields.is_empty() {
            return writeln!(f, " {{}}");
        }
        writeln!(f, " {{")?;
        for field in &self.fields {
            writeln!(f, "    {} {}", field.name, field.ty)?;
        }
        writeln!(f, "  }}")
    }
}

/// A request/response entry point.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Verb {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    #[serde(default)]
    pub export: bool,
    pub request: Type,
    pub response: Type,
    /// Opaque schedule expression; present when this verb runs on a timer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    /// HTTP ingress binding, when this verb is exposed through ingress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,
}

/// HTTP binding for an ingress-exposed verb.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct IngressSpec {
    pub method: String,
    pub path: String,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_comments(f, "  ", &self.comments)?;
        if let Some(cron) = &self.cron {
            writeln!(f, "  +cron {cron}")?;
        }
        if let Some(ingress) = &self.ingress {
            writeln!(f, "  +ingress {} {}", ingress.method, ingress.path)?;
        }
        writeln!(
            f,
            "  {}verb {}({}) {}",
            export_prefix(self.export),
            self.name,
            self.request,
            self.response
        )
    }
}

/// An enum declaration.
///
/// Two shapes exist: value enums, where every variant carries a constant of a
/// single type, and type enums, where each variant carries a distinct type.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EnumDecl {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    #[serde(default)]
    pub export: bool,
    pub variants: EnumVariants,
}

/// The variant set of an [`EnumDecl`], split by shape.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum EnumVariants {
    Value {
        #[serde(rename = "type")]
        ty: Type,
        variants: Vec<ValueVariant>,
    },
    Type(Vec<TypeVariant>),
}

/// A variant of a value enum: a name bound to a string or integer constant.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ValueVariant {
    pub name: String,
    pub value: serde_json::Value,
}

/// A variant of a type enum: a name bound to a type.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TypeVariant {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Type,
}

impl fmt::Display for EnumDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_comments(f, "  ", &self.comments)?;
        match &self.variants {
            EnumVariants::Value { ty, variants } => {
                writeln!(
                    f,
                    "  {}enum {}({}) {{",
                    export_prefix(self.export),
                    self.name,
                    ty
                )?;
                for v in variants {
                    writeln!(f, "    {} = {}", v.name, v.value)?;
                }
            }
            EnumVariants::Type(variants) => {
                writeln!(f, "  {}enum {} {{", export_prefix(self.export), self.name)?;
                for v in variants {
                    writeln!(f, "    {} {}", v.name, v.ty)?;
                }
            }
        }
        writeln!(f, "  }}")
    }
}

/// A pub/sub topic owned by this module.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Topic {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    pub event: Type,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_comments(f, "  ", &self.comments)?;
        writeln!(f, "  topic {} {}", self.name, self.event)
    }
}

/// A named cursor over another module's topic.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Subscription {
    pub name: String,
    pub topic: Ref,
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  subscription {} {}", self.name, self.topic)
    }
}

/// A finite-state machine whose states are verbs.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Fsm {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
    /// Entry states.
    pub start: Vec<Ref>,
    pub transitions: Vec<FsmTransition>,
}

/// One edge of an [`Fsm`]. A missing `from` means the transition may fire
/// from any start state.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FsmTransition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Ref>,
    pub to: Ref,
}

impl fmt::Display for Fsm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_comments(f, "  ", &self.comments)?;
        writeln!(f, "  fsm {} {{", self.name)?;
        for start in &self.start {
            writeln!(f, "    start {start}")?;
        }
        for t in &self.transitions {
            match &t.from {
                Some(from) => writeln!(f, "    transition {from} to {}", t.to)?,
                None => writeln!(f, "    transition to {}", t.to)?,
            }
        }
        writeln!(f, "  }}")
    }
}

fn export_prefix(export: bool) -> &'static str {
    if export {
        "export "
    } else {
        ""
    }
}

fn write_comments(f: &mut fmt::Formatter<'_>, indent: &str, comments: &[String]) -> fmt::Result {
    for comment in comments {
        writeln!(f, "{indent}// {comment}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imports_are_sorted_and_deduped() {
        let module = Module {
            name: "shop".to_string(),
            comments: vec![],
            decls: vec![
                Decl::Verb(Verb {
                    name: "checkout".to_string(),
                    comments: vec![],
                    export: true,
                    request: Type::Ref(Ref::new("billing", "Invoice")),
                    response: Type::Ref(Ref::new("builtin", "Empty")),
                    cron: None,
                    ingress: None,
                }),
                Decl::Subscription(Subscription {
                    name: "invoices".to_string(),
                    topic: Ref::new("billing", "invoiceEvents"),
                }),
                Decl::Data(Data {
                    name: "Cart".to_string(),
                    comments: vec![],
                    export: false,
                    fields: vec![Field {
                        name: "self_ref".to_string(),
                        ty: Type::Optional(Box::new(Type::Ref(Ref::new("shop", "Cart")))),
                    }],
                }),
            ],
        };
        assert_eq!(module.imports(), vec!["billing", "builtin"]);
    }

    #[test]
    fn enum_shapes_render_distinctly() {
        let value_enum = EnumDecl {
            name: "Color".to_string(),
            comments: vec![],
            export: true,
            variants: EnumVariants::Value {
                ty: Type::String,
                variants: vec![ValueVariant {
                    name: "Red".to_string(),
                    value: serde_json::json!("Red"),
                }],
            },
        };
        let type_enum = EnumDecl {
            name: "Shape".to_string(),
            comments: vec![],
            export: true,
            variants: EnumVariants::Type(vec![TypeVariant {
                name: "A".to_string(),
                ty: Type::Int,
            }]),
        };
        assert!(value_enum.to_string().contains("enum Color(String)"));
        assert!(value_enum.to_string().contains("Red = \"Red\""));
        assert!(type_enum.to_string().contains("enum Shape {"));
        assert!(type_enum.to_string().contains("A Int"));
    }

    #[test]
    fn fsm_display() {
        let fsm = Fsm {
            name: "payment".to_string(),
            comments: vec![],
            start: vec![Ref::new("payment", "created")],
            transitions: vec![FsmTransition {
                from: Some(Ref::new("payment", "created")),
                to: Ref::new("payment", "paid"),
            }],
        };
        let text = fsm.to_string();
        assert!(text.contains("start payment.created"));
        assert!(text.contains("transition payment.created to payment.paid"));
    }
}
