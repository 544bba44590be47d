//! Delivery of codes and notices to users.
//!
//! The [`NotificationHandler`] is a spooled handler on the user aggregate.
//! Events reach it at least once, so before sending it scans the user's later
//! events for the matching "sent" marker, or for a newer code of the same
//! kind, and skips codes whose validity has passed. After a delivery it
//! appends the marker as [`NOTIFICATION_EDITOR`].
//!
//! A crash between delivery and marker leads to a second delivery on
//! restart; no event leads to two deliveries otherwise.

use crate::commands::UserCommands;
use crate::events::{
    user_aggregate_type, DomainClaimed, DomainClaimedSent, EmailCodeAdded, EmailCodeSent,
    InitialCodeAdded, InitialCodeSent, PasswordCodeAdded, PasswordCodeSent,
    PasswordlessInitCodeRequested, PasswordlessInitCodeSent, PhoneCodeAdded, PhoneCodeSent,
};
use crate::types::SecretCode;
use crate::write_model::UserWriteModel;
use async_trait::async_trait;
use idcore::clock::system_clock;
use idcore::idempotency::{
    already_handled, already_handled_matching, code_already_handled_or_expired, code_expired,
};
use idcore::{
    AggregateId, AggregateType, EditorUser, Event, EventPayload, EventStore, Handler,
    HandlerError, HandlerResult, SharedClock,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Name of the notification handler.
pub const NOTIFICATION_HANDLER: &str = "notification";

/// Editor of the "sent" events the handler appends.
pub const NOTIFICATION_EDITOR: &str = "NOTIFICATION";

/// What a notification is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Code to finish the initial setup.
    InitCode,
    /// Code to verify an e-mail address.
    EmailVerificationCode,
    /// Code to verify a phone number.
    PhoneVerificationCode,
    /// Password reset code.
    PasswordResetCode,
    /// The login name was changed because another organisation claimed its
    /// domain.
    DomainClaimed,
    /// Link to register a passwordless authenticator.
    PasswordlessRegistrationLink,
}

/// One message to deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// What the message is about.
    pub kind: NotificationKind,
    /// Addressed user.
    pub user_id: AggregateId,
    /// E-mail address or phone number.
    pub recipient: String,
    /// Template data, e.g. `code` or `userName`.
    pub data: Map<String, Value>,
}

/// Failure to deliver a notification; retried on the next tick.
#[derive(Debug, Clone, Error)]
pub enum NotifyError {
    /// The provider rejected or did not accept the message.
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// A channel notifications are delivered through.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers `notification`.
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

#[async_trait]
impl<T: Notifier + ?Sized> Notifier for Arc<T> {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        (**self).send(notification).await
    }
}

/// Logs notifications instead of delivering them; for development setups
/// without a mail or SMS provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            kind = ?notification.kind,
            user_id = %notification.user_id,
            recipient = %notification.recipient,
            "notification delivered to log"
        );
        Ok(())
    }
}

/// The four code kinds, which share their delivery flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodeKind {
    Init,
    EmailVerification,
    PhoneVerification,
    PasswordReset,
}

impl CodeKind {
    /// Events that make a code of this kind obsolete: a newer code or the
    /// delivery marker.
    const fn handled_by(self) -> [&'static str; 2] {
        match self {
            Self::Init => [InitialCodeAdded::EVENT_TYPE, InitialCodeSent::EVENT_TYPE],
            Self::EmailVerification => [EmailCodeAdded::EVENT_TYPE, EmailCodeSent::EVENT_TYPE],
            Self::PhoneVerification => [PhoneCodeAdded::EVENT_TYPE, PhoneCodeSent::EVENT_TYPE],
            Self::PasswordReset => [PasswordCodeAdded::EVENT_TYPE, PasswordCodeSent::EVENT_TYPE],
        }
    }

    const fn notification_kind(self) -> NotificationKind {
        match self {
            Self::Init => NotificationKind::InitCode,
            Self::EmailVerification => NotificationKind::EmailVerificationCode,
            Self::PhoneVerification => NotificationKind::PhoneVerificationCode,
            Self::PasswordReset => NotificationKind::PasswordResetCode,
        }
    }

    fn recipient(self, user: &UserWriteModel) -> Option<String> {
        match self {
            Self::PhoneVerification => user.phone.as_ref().map(ToString::to_string),
            _ => user.email.as_ref().map(ToString::to_string),
        }
    }
}

/// Sends codes and notices for user events.
pub struct NotificationHandler<S, N> {
    commands: UserCommands<S>,
    notifier: N,
    clock: SharedClock,
}

impl<S, N> std::fmt::Debug for NotificationHandler<S, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHandler").finish_non_exhaustive()
    }
}

impl<S: EventStore, N: Notifier> NotificationHandler<S, N> {
    /// Delivers through `notifier` and records deliveries with `commands`.
    pub fn new(commands: UserCommands<S>, notifier: N) -> Self {
        Self {
            commands,
            notifier,
            clock: system_clock(),
        }
    }

    /// Uses `clock` for code expiry.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn editor() -> EditorUser {
        EditorUser::new(NOTIFICATION_EDITOR)
    }

    /// The user the event belongs to, if it still exists.
    async fn existing_user(&self, event: &Event) -> HandlerResult<Option<UserWriteModel>> {
        let user = self.commands.user(&event.aggregate_id).await?;
        if !user.exists() {
            debug!(user_id = %event.aggregate_id, "user is gone, nothing to send");
            return Ok(None);
        }
        Ok(Some(user))
    }

    async fn deliver(&self, notification: Notification) -> HandlerResult<()> {
        self.notifier
            .send(&notification)
            .await
            .map_err(HandlerError::internal)?;
        info!(
            kind = ?notification.kind,
            user_id = %notification.user_id,
            "notification sent"
        );
        Ok(())
    }

    async fn send_code(
        &self,
        event: &Event,
        kind: CodeKind,
        code: &SecretCode,
    ) -> HandlerResult<()> {
        let store = self.commands.store();
        if code_already_handled_or_expired(
            store,
            self.clock.as_ref(),
            event,
            code.expiry(),
            &kind.handled_by(),
        )
        .await?
        {
            return Ok(());
        }
        let Some(user) = self.existing_user(event).await? else {
            return Ok(());
        };
        let Some(recipient) = kind.recipient(&user) else {
            debug!(user_id = %event.aggregate_id, ?kind, "no address to send the code to");
            return Ok(());
        };

        let mut data = Map::new();
        data.insert("code".to_string(), Value::String(code.code.clone()));
        self.deliver(Notification {
            kind: kind.notification_kind(),
            user_id: event.aggregate_id.clone(),
            recipient,
            data,
        })
        .await?;

        let user_id = &event.aggregate_id;
        let editor = Self::editor();
        let _ = match kind {
            CodeKind::Init => self.commands.initial_code_sent(user_id, &editor).await?,
            CodeKind::EmailVerification => self.commands.email_code_sent(user_id, &editor).await?,
            CodeKind::PhoneVerification => self.commands.phone_code_sent(user_id, &editor).await?,
            CodeKind::PasswordReset => self.commands.password_code_sent(user_id, &editor).await?,
        };
        Ok(())
    }

    async fn send_domain_claimed(&self, event: &Event) -> HandlerResult<()> {
        let handled_by = [DomainClaimed::EVENT_TYPE, DomainClaimedSent::EVENT_TYPE];
        if already_handled(self.commands.store(), event, &handled_by).await? {
            return Ok(());
        }
        let claimed: DomainClaimed = event.payload_as()?;
        let Some(user) = self.existing_user(event).await? else {
            return Ok(());
        };
        let Some(email) = user.email else {
            return Ok(());
        };

        let mut data = Map::new();
        data.insert("userName".to_string(), Value::String(claimed.username.to_string()));
        self.deliver(Notification {
            kind: NotificationKind::DomainClaimed,
            user_id: event.aggregate_id.clone(),
            recipient: email.to_string(),
            data,
        })
        .await?;

        let _ = self
            .commands
            .domain_claimed_sent(&event.aggregate_id, &Self::editor())
            .await?;
        Ok(())
    }

    async fn send_passwordless_link(&self, event: &Event) -> HandlerResult<()> {
        let requested: PasswordlessInitCodeRequested = event.payload_as()?;
        if code_expired(self.clock.as_ref(), event, requested.code.expiry()) {
            debug!(sequence = %event.sequence, "passwordless link expired");
            return Ok(());
        }
        let id = requested.id.as_str();
        let delivered = already_handled_matching(
            self.commands.store(),
            event,
            &[PasswordlessInitCodeSent::EVENT_TYPE],
            |later| {
                later
                    .payload_as::<PasswordlessInitCodeSent>()
                    .is_ok_and(|sent| sent.id == id)
            },
        )
        .await?;
        if delivered {
            return Ok(());
        }
        let Some(user) = self.existing_user(event).await? else {
            return Ok(());
        };
        let Some(email) = user.email else {
            return Ok(());
        };

        let mut data = Map::new();
        data.insert("id".to_string(), Value::String(requested.id.clone()));
        data.insert("code".to_string(), Value::String(requested.code.code.clone()));
        self.deliver(Notification {
            kind: NotificationKind::PasswordlessRegistrationLink,
            user_id: event.aggregate_id.clone(),
            recipient: email.to_string(),
            data,
        })
        .await?;

        let _ = self
            .commands
            .passwordless_init_code_sent(&event.aggregate_id, id, &Self::editor())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<S: EventStore, N: Notifier> Handler for NotificationHandler<S, N> {
    fn name(&self) -> &str {
        NOTIFICATION_HANDLER
    }

    fn aggregate_types(&self) -> Vec<AggregateType> {
        vec![user_aggregate_type()]
    }

    #[instrument(
        name = "notification.reduce",
        skip(self, event),
        fields(sequence = %event.sequence, event_type = %event.event_type)
    )]
    async fn reduce(&self, event: &Event) -> HandlerResult<()> {
        match event.event_type.as_ref() {
            InitialCodeAdded::EVENT_TYPE => {
                let added: InitialCodeAdded = event.payload_as()?;
                self.send_code(event, CodeKind::Init, &added.code).await
            }
            EmailCodeAdded::EVENT_TYPE => {
                let added: EmailCodeAdded = event.payload_as()?;
                self.send_code(event, CodeKind::EmailVerification, &added.code)
                    .await
            }
            PhoneCodeAdded::EVENT_TYPE => {
                let added: PhoneCodeAdded = event.payload_as()?;
                self.send_code(event, CodeKind::PhoneVerification, &added.code)
                    .await
            }
            PasswordCodeAdded::EVENT_TYPE => {
                let added: PasswordCodeAdded = event.payload_as()?;
                self.send_code(event, CodeKind::PasswordReset, &added.code)
                    .await
            }
            DomainClaimed::EVENT_TYPE => self.send_domain_claimed(event).await,
            PasswordlessInitCodeRequested::EVENT_TYPE => self.send_passwordless_link(event).await,
            _ => Ok(()),
        }
    }
}
