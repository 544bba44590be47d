//! Declarative uniqueness claims attached to events.
//!
//! A constraint is a `(unique_type, unique_field)` token. Adding a token that is
//! already held fails the whole append; removing a token frees it. Because the
//! store applies constraints in event order inside one atomic append, a rename
//! is expressed as "remove old" followed by "add new" on the same event.

use serde::{Deserialize, Serialize};

/// Whether a constraint claims or releases its token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniqueConstraintAction {
    /// Claim the token; fails if it is held.
    Add,
    /// Release the token; a no-op if it is not held.
    Remove,
}

/// One uniqueness claim or release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    unique_type: String,
    unique_field: String,
    action: UniqueConstraintAction,
    error_message: String,
}

impl UniqueConstraint {
    /// Claims `unique_field` in the `unique_type` table.
    ///
    /// `error_message` is returned to the caller when the token is taken.
    pub fn add(
        unique_type: impl Into<String>,
        unique_field: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            unique_type: unique_type.into(),
            unique_field: unique_field.into(),
            action: UniqueConstraintAction::Add,
            error_message: error_message.into(),
        }
    }

    /// Releases `unique_field` in the `unique_type` table.
    pub fn remove(unique_type: impl Into<String>, unique_field: impl Into<String>) -> Self {
        Self {
            unique_type: unique_type.into(),
            unique_field: unique_field.into(),
            action: UniqueConstraintAction::Remove,
            error_message: String::new(),
        }
    }

    /// Constraint table name.
    pub fn unique_type(&self) -> &str {
        &self.unique_type
    }

    /// The claimed value.
    pub fn unique_field(&self) -> &str {
        &self.unique_field
    }

    /// Add or remove.
    pub const fn action(&self) -> UniqueConstraintAction {
        self.action
    }

    /// Message used for `AlreadyExists` errors.
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    /// Key under which stores index the token.
    pub fn key(&self) -> (String, String) {
        (self.unique_type.clone(), self.unique_field.clone())
    }
}
