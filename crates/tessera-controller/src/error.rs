// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The DAL error taxonomy.
//!
//! Every database error is translated into one of three semantic kinds —
//! *not found*, *conflict*, *constraint violation* — or passed through
//! opaque. Callers match on the kind with the `is_*` predicates, which stay
//! true across context wrapping; nothing outside this module looks at
//! PostgreSQL error codes.

use thiserror::Error;

/// Result type for DAL operations.
pub type DalResult<T> = Result<T, DalError>;

/// Errors surfaced by the data-access layer.
#[derive(Debug, Error)]
pub enum DalError {
    /// No matching row, or a foreign key referenced a missing row. The
    /// message names what was missing (for FK violations, the constraint
    /// stem).
    #[error("{0}: not found")]
    NotFound(String),

    /// A uniqueness guarantee was violated.
    #[error("{0}: conflict")]
    Conflict(String),

    /// Any other integrity constraint was violated.
    #[error("{0}: constraint violation")]
    Constraint(String),

    /// Opaque database failure, passed through with its message intact.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// A context prefix wrapped around another DAL error; preserves kind.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<DalError>,
    },
}

impl DalError {
    /// Translate a sqlx error into the three-kind taxonomy.
    pub fn translate(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => return DalError::NotFound("row".to_string()),
            sqlx::Error::Database(db) => {
                if let Some(code) = db.code() {
                    let code = code.as_ref();
                    // Class 23 - integrity constraint violations.
                    if code == "23503" {
                        // Foreign key: expose the constraint stem, e.g.
                        // "deployment_artefacts_artefact_id_fkey" -> "artefact".
                        let name = db.constraint().unwrap_or("reference");
                        return DalError::NotFound(constraint_stem(name).to_string());
                    }
                    if code == "23505" {
                        return DalError::Conflict(db.message().to_string());
                    }
                    if code.starts_with("23") {
                        return DalError::Constraint(db.message().to_string());
                    }
                }
            }
            _ => {}
        }
        DalError::Database(err)
    }

    /// Wrap with a context prefix, preserving the kind.
    pub fn context(self, context: impl Into<String>) -> Self {
        DalError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    fn kind(&self) -> Option<Kind> {
        match self {
            DalError::NotFound(_) => Some(Kind::NotFound),
            DalError::Conflict(_) => Some(Kind::Conflict),
            DalError::Constraint(_) => Some(Kind::Constraint),
            DalError::Database(sqlx::Error::RowNotFound) => Some(Kind::NotFound),
            DalError::Database(_) => None,
            DalError::Context { source, .. } => source.kind(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == Some(Kind::NotFound)
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == Some(Kind::Conflict)
    }

    pub fn is_constraint(&self) -> bool {
        self.kind() == Some(Kind::Constraint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    NotFound,
    Conflict,
    Constraint,
}

/// Strip the table prefix and `_id_fkey` suffix from a foreign key
/// constraint name, leaving the referenced entity.
fn constraint_stem(name: &str) -> &str {
    let name = name.strip_suffix("_id_fkey").unwrap_or(name);
    match name.split('_').next_back() {
        Some(stem) if !stem.is_empty() => stem,
        _ => name,
    }
}

/// Extension for terse translation at call sites:
/// `query(...).await.map_err(DalError::translate)?` becomes `.trans()?`.
pub trait SqlxResultExt<T> {
    fn trans(self) -> DalResult<T>;
}

impl<T> SqlxResultExt<T> for Result<T, sqlx::Error> {
    fn trans(self) -> DalResult<T> {
        self.map_err(DalError::translate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_translates() {
        let err = DalError::translate(sqlx::Error::RowNotFound);
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
    }

    #[test]
    fn kind_survives_wrapping() {
        let err = DalError::Conflict("duplicate key".to_string())
            .context("replace deployment")
            .context("controller");
        assert!(err.is_conflict());
        assert_eq!(
            err.to_string(),
            "controller: replace deployment: duplicate key: conflict"
        );
    }

    #[test]
    fn transition_conflict_message_shape() {
        // The FSM start path surfaces busy instances in exactly this form.
        let err = DalError::Conflict("transition already executing".to_string());
        assert!(err.to_string().starts_with("transition already executing"));
        assert!(err.to_string().ends_with("conflict"));
    }

    #[test]
    fn constraint_stem_extraction() {
        assert_eq!(constraint_stem("deployment_artefacts_artefact_id_fkey"), "artefact");
        assert_eq!(constraint_stem("runners_deployment_id_fkey"), "deployment");
        assert_eq!(constraint_stem("weird"), "weird");
    }

    #[test]
    fn opaque_errors_have_no_kind() {
        let err = DalError::Database(sqlx::Error::PoolClosed);
        assert!(!err.is_not_found());
        assert!(!err.is_conflict());
        assert!(!err.is_constraint());
    }
}
