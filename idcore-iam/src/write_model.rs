//! User state replayed for command validation.

use crate::events::{
    user_aggregate_type, DomainClaimed, EmailChanged, EmailCodeAdded, EmailVerified, HumanAdded,
    PhoneChanged, UserDeactivated, UserLocked, UserReactivated, UserRemoved, UserUnlocked,
    UsernameChanged,
};
use crate::types::{Email, Phone, SecretCode, UserState, Username};
use chrono::{DateTime, Utc};
use idcore::idempotency::expires_at;
use idcore::{AggregateId, Event, EventPayload, EventQuery, ResourceOwner, WriteModel};

/// A code waiting to be verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCode {
    /// The code.
    pub code: SecretCode,
    /// When the code was generated.
    pub created_at: DateTime<Utc>,
}

impl PendingCode {
    /// Whether the code is still valid at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        expires_at(self.created_at, self.code.expiry()).map_or(true, |deadline| deadline >= now)
    }
}

/// Current state of one user, rebuilt from its events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserWriteModel {
    user_id: AggregateId,
    /// Owning organisation, once the user exists.
    pub resource_owner: Option<ResourceOwner>,
    /// Lifecycle state; `None` before creation and after removal.
    pub state: Option<UserState>,
    /// Current login name.
    pub username: Option<Username>,
    /// Current e-mail address.
    pub email: Option<Email>,
    /// Whether the current address was verified.
    pub is_email_verified: bool,
    /// Unverified e-mail code, if one is outstanding.
    pub email_code: Option<PendingCode>,
    /// Current phone number.
    pub phone: Option<Phone>,
}

impl UserWriteModel {
    /// An empty model of user `user_id`.
    pub const fn new(user_id: AggregateId) -> Self {
        Self {
            user_id,
            resource_owner: None,
            state: None,
            username: None,
            email: None,
            is_email_verified: false,
            email_code: None,
            phone: None,
        }
    }

    /// The user's id.
    pub const fn user_id(&self) -> &AggregateId {
        &self.user_id
    }

    /// Whether the user was added and not removed.
    pub const fn exists(&self) -> bool {
        self.state.is_some()
    }
}

impl WriteModel for UserWriteModel {
    fn query(&self) -> EventQuery {
        EventQuery::new().aggregate(user_aggregate_type(), self.user_id.clone())
    }

    fn reduce(&mut self, event: &Event) {
        match event.event_type.as_ref() {
            HumanAdded::EVENT_TYPE => {
                if let Ok(added) = event.payload_as::<HumanAdded>() {
                    self.resource_owner = Some(event.resource_owner.clone());
                    self.state = Some(UserState::Active);
                    self.username = Some(added.username);
                    self.email = Some(added.email);
                    self.is_email_verified = false;
                    self.phone = added.phone;
                }
            }
            UsernameChanged::EVENT_TYPE => {
                if let Ok(changed) = event.payload_as::<UsernameChanged>() {
                    self.username = Some(changed.username);
                }
            }
            DomainClaimed::EVENT_TYPE => {
                if let Ok(claimed) = event.payload_as::<DomainClaimed>() {
                    self.username = Some(claimed.username);
                }
            }
            EmailChanged::EVENT_TYPE => {
                if let Ok(changed) = event.payload_as::<EmailChanged>() {
                    self.email = Some(changed.email);
                    self.is_email_verified = false;
                    self.email_code = None;
                }
            }
            EmailCodeAdded::EVENT_TYPE => {
                if let Ok(added) = event.payload_as::<EmailCodeAdded>() {
                    self.email_code = Some(PendingCode {
                        code: added.code,
                        created_at: event.creation_date,
                    });
                }
            }
            EmailVerified::EVENT_TYPE => {
                self.is_email_verified = true;
                self.email_code = None;
            }
            PhoneChanged::EVENT_TYPE => {
                if let Ok(changed) = event.payload_as::<PhoneChanged>() {
                    self.phone = Some(changed.phone);
                }
            }
            UserLocked::EVENT_TYPE => self.state = Some(UserState::Locked),
            UserDeactivated::EVENT_TYPE => self.state = Some(UserState::Inactive),
            UserUnlocked::EVENT_TYPE | UserReactivated::EVENT_TYPE => {
                self.state = Some(UserState::Active);
            }
            UserRemoved::EVENT_TYPE => {
                self.state = None;
                self.username = None;
            }
            _ => {}
        }
    }
}
