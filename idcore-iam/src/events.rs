//! Events of the user aggregate.
//!
//! Every payload implements [`EventPayload`]; the username claims travel with
//! the events that take or release a login name, so the store enforces
//! uniqueness atomically with the append.

use crate::types::{Email, Phone, SecretCode, Username};
use idcore::{
    AggregateId, AggregateRef, AggregateType, EventPayload, ResourceOwner, UniqueConstraint,
};
use serde::{Deserialize, Serialize};

/// Aggregate type of users.
pub const USER_AGGREGATE: &str = "user";

/// Unique constraint table holding taken login names.
pub const UNIQUE_USERNAME: &str = "usernames";

/// Message of a rejected username claim.
pub const USERNAME_TAKEN: &str = "Errors.User.AlreadyExists";

/// The user aggregate type.
pub fn user_aggregate_type() -> AggregateType {
    AggregateType::new(USER_AGGREGATE)
}

/// Reference to the user `id` owned by `resource_owner`.
pub fn user_aggregate(id: AggregateId, resource_owner: ResourceOwner) -> AggregateRef {
    AggregateRef::new(user_aggregate_type(), id, resource_owner)
}

fn unique_username(
    username: &Username,
    resource_owner: &ResourceOwner,
    must_be_domain: bool,
) -> String {
    if must_be_domain {
        format!("{username}{resource_owner}")
    } else {
        username.to_string()
    }
}

/// Claims `username`.
pub fn add_username_constraint(
    username: &Username,
    resource_owner: &ResourceOwner,
    must_be_domain: bool,
) -> UniqueConstraint {
    UniqueConstraint::add(
        UNIQUE_USERNAME,
        unique_username(username, resource_owner, must_be_domain),
        USERNAME_TAKEN,
    )
}

/// Releases `username`.
pub fn remove_username_constraint(
    username: &Username,
    resource_owner: &ResourceOwner,
    must_be_domain: bool,
) -> UniqueConstraint {
    UniqueConstraint::remove(
        UNIQUE_USERNAME,
        unique_username(username, resource_owner, must_be_domain),
    )
}

/// Release of `old` followed by the claim of `new`.
fn rename_constraints(
    old: Option<&Username>,
    new: &Username,
    resource_owner: &ResourceOwner,
    must_be_domain: bool,
) -> Vec<UniqueConstraint> {
    old.map(|old| remove_username_constraint(old, resource_owner, must_be_domain))
        .into_iter()
        .chain([add_username_constraint(new, resource_owner, must_be_domain)])
        .collect()
}

/// Payload-less events.
macro_rules! marker_events {
    ($($(#[$meta:meta])* $name:ident => $event_type:literal),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
            pub struct $name;

            impl EventPayload for $name {
                const EVENT_TYPE: &'static str = $event_type;

                fn has_data(&self) -> bool {
                    false
                }
            }
        )*
    };
}

marker_events! {
    /// The domain-claimed notice was delivered.
    DomainClaimedSent => "user.domain.claimed.sent",
    /// The e-mail verification code was delivered.
    EmailCodeSent => "user.human.email.code.sent",
    /// The e-mail address was verified.
    EmailVerified => "user.human.email.verified",
    /// The phone verification code was delivered.
    PhoneCodeSent => "user.human.phone.code.sent",
    /// The password reset code was delivered.
    PasswordCodeSent => "user.human.password.code.sent",
    /// The initialization code was delivered.
    InitialCodeSent => "user.human.initialization.code.sent",
    /// The user was locked.
    UserLocked => "user.locked",
    /// The user was unlocked.
    UserUnlocked => "user.unlocked",
    /// The user was deactivated.
    UserDeactivated => "user.deactivated",
    /// The user was reactivated.
    UserReactivated => "user.reactivated",
}

/// A human user was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HumanAdded {
    /// Login name.
    #[serde(rename = "userName")]
    pub username: Username,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Name shown in user interfaces.
    pub display_name: String,
    /// E-mail address, unverified.
    pub email: Email,
    /// Phone number, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<Phone>,
    /// Whether the organisation scopes login names to itself.
    #[serde(skip)]
    pub user_login_must_be_domain: bool,
}

impl EventPayload for HumanAdded {
    const EVENT_TYPE: &'static str = "user.human.added";

    fn unique_constraints(&self, aggregate: &AggregateRef) -> Vec<UniqueConstraint> {
        vec![add_username_constraint(
            &self.username,
            &aggregate.resource_owner,
            self.user_login_must_be_domain,
        )]
    }
}

/// The user picked a new login name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameChanged {
    /// The new login name.
    #[serde(rename = "userName")]
    pub username: Username,
    /// The released login name; only known when the event is created.
    #[serde(skip)]
    pub old_username: Option<Username>,
    /// Whether the organisation scopes login names to itself.
    #[serde(skip)]
    pub user_login_must_be_domain: bool,
}

impl EventPayload for UsernameChanged {
    const EVENT_TYPE: &'static str = "user.username.changed";

    fn unique_constraints(&self, aggregate: &AggregateRef) -> Vec<UniqueConstraint> {
        rename_constraints(
            self.old_username.as_ref(),
            &self.username,
            &aggregate.resource_owner,
            self.user_login_must_be_domain,
        )
    }
}

/// Another organisation verified the domain of the user's login name; the
/// user was moved to a generated name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainClaimed {
    /// The generated login name.
    #[serde(rename = "userName")]
    pub username: Username,
    /// The released login name; only known when the event is created.
    #[serde(skip)]
    pub old_username: Option<Username>,
    /// Whether the organisation scopes login names to itself.
    #[serde(skip)]
    pub user_login_must_be_domain: bool,
}

impl EventPayload for DomainClaimed {
    const EVENT_TYPE: &'static str = "user.domain.claimed";

    fn unique_constraints(&self, aggregate: &AggregateRef) -> Vec<UniqueConstraint> {
        rename_constraints(
            self.old_username.as_ref(),
            &self.username,
            &aggregate.resource_owner,
            self.user_login_must_be_domain,
        )
    }
}

/// The user was removed; the login name becomes available again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRemoved {
    /// The released login name; only known when the event is created.
    #[serde(skip)]
    pub username: Option<Username>,
    /// Whether the organisation scopes login names to itself.
    #[serde(skip)]
    pub user_login_must_be_domain: bool,
}

impl EventPayload for UserRemoved {
    const EVENT_TYPE: &'static str = "user.removed";

    fn unique_constraints(&self, aggregate: &AggregateRef) -> Vec<UniqueConstraint> {
        self.username
            .iter()
            .map(|username| {
                remove_username_constraint(
                    username,
                    &aggregate.resource_owner,
                    self.user_login_must_be_domain,
                )
            })
            .collect()
    }

    fn has_data(&self) -> bool {
        false
    }
}

/// The e-mail address changed and is unverified again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailChanged {
    /// The new address.
    pub email: Email,
}

impl EventPayload for EmailChanged {
    const EVENT_TYPE: &'static str = "user.human.email.changed";
}

/// The phone number changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneChanged {
    /// The new number.
    pub phone: Phone,
}

impl EventPayload for PhoneChanged {
    const EVENT_TYPE: &'static str = "user.human.phone.changed";
}

/// Events that hand out a one-time code.
macro_rules! code_events {
    ($($(#[$meta:meta])* $name:ident => $event_type:literal),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
            pub struct $name {
                /// The code and its validity.
                #[serde(flatten)]
                pub code: SecretCode,
            }

            impl EventPayload for $name {
                const EVENT_TYPE: &'static str = $event_type;
            }
        )*
    };
}

code_events! {
    /// A code to verify the e-mail address was generated.
    EmailCodeAdded => "user.human.email.code.added",
    /// A code to verify the phone number was generated.
    PhoneCodeAdded => "user.human.phone.code.added",
    /// A password reset code was generated.
    PasswordCodeAdded => "user.human.password.code.added",
    /// A code to finish the user's initial setup was generated.
    InitialCodeAdded => "user.human.initialization.code.added",
}

/// A link to register a passwordless authenticator was requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordlessInitCodeRequested {
    /// Correlates the request with its delivery.
    pub id: String,
    /// The code and its validity.
    #[serde(flatten)]
    pub code: SecretCode,
}

impl EventPayload for PasswordlessInitCodeRequested {
    const EVENT_TYPE: &'static str = "user.human.passwordless.initialization.code.requested";
}

/// The passwordless registration link `id` was delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordlessInitCodeSent {
    /// Id of the delivered request.
    pub id: String,
}

impl EventPayload for PasswordlessInitCodeSent {
    const EVENT_TYPE: &'static str = "user.human.passwordless.initialization.code.sent";
}
