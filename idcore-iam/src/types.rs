//! Validated value types of the identity domain.

use nutype::nutype;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Login name of a user.
///
/// Unique across the instance, or per organisation when the organisation
/// requires domain-scoped login names.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 200),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Username(String);

/// E-mail address of a human user.
#[nutype(
    sanitize(trim, lowercase),
    validate(not_empty, len_char_max = 320, predicate = |email: &str| email.contains('@')),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Email(String);

/// Phone number of a human user.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 50),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct Phone(String);

/// Lifecycle state of a user as stored in the `state` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum UserState {
    /// The user can log in.
    Active,
    /// Deactivated by an administrator.
    Inactive,
    /// Locked, e.g. after too many failed logins.
    Locked,
}

/// A stored state value that is not a [`UserState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown user state {0}")]
pub struct UnknownUserState(pub i64);

impl UserState {
    /// Column value of the state.
    pub const fn as_i64(self) -> i64 {
        match self {
            Self::Active => 1,
            Self::Inactive => 2,
            Self::Locked => 4,
        }
    }
}

impl From<UserState> for i64 {
    fn from(state: UserState) -> Self {
        state.as_i64()
    }
}

impl TryFrom<i64> for UserState {
    type Error = UnknownUserState;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Active),
            2 => Ok(Self::Inactive),
            4 => Ok(Self::Locked),
            other => Err(UnknownUserState(other)),
        }
    }
}

/// A one-time code together with how long it stays valid.
///
/// The code is stored as given; callers pass an already encrypted value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretCode {
    /// The code.
    pub code: String,
    /// Validity in seconds, counted from the event's creation date.
    #[serde(rename = "expiry")]
    pub expiry_seconds: u64,
}

impl SecretCode {
    /// A code valid for `expiry`.
    pub fn new(code: impl Into<String>, expiry: Duration) -> Self {
        Self {
            code: code.into(),
            expiry_seconds: expiry.as_secs(),
        }
    }

    /// Validity of the code.
    pub const fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails_are_normalized() {
        let email = Email::try_new("  Gigi@Example.COM ").unwrap();
        assert_eq!(email.as_ref(), "gigi@example.com");
        assert!(Email::try_new("not-an-address").is_err());
    }

    #[test]
    fn usernames_must_not_be_blank() {
        assert!(Username::try_new("   ").is_err());
        assert_eq!(Username::try_new(" gigi ").unwrap().as_ref(), "gigi");
    }

    #[test]
    fn states_round_trip_through_their_column_value() {
        for state in [UserState::Active, UserState::Inactive, UserState::Locked] {
            assert_eq!(UserState::try_from(state.as_i64()), Ok(state));
        }
        assert_eq!(UserState::try_from(3), Err(UnknownUserState(3)));
    }

    #[test]
    fn codes_serialize_their_expiry_in_seconds() {
        let code = SecretCode::new("abc", Duration::from_secs(600));
        let json = serde_json::to_value(&code).unwrap();

        assert_eq!(json, serde_json::json!({"code": "abc", "expiry": 600}));
        assert_eq!(code.expiry(), Duration::from_secs(600));
    }
}
