//! User commands.
//!
//! Each command replays the user's write model, decides on one event and
//! appends it with the version it saw. Concurrent writers on the same user
//! surface as concurrency conflicts and the whole command runs again.

use crate::events::{
    user_aggregate, DomainClaimed, DomainClaimedSent, EmailChanged, EmailCodeAdded, EmailCodeSent,
    EmailVerified, HumanAdded, InitialCodeAdded, InitialCodeSent, PasswordCodeAdded,
    PasswordCodeSent, PasswordlessInitCodeRequested, PasswordlessInitCodeSent, PhoneChanged,
    PhoneCodeAdded, PhoneCodeSent, UserDeactivated, UserLocked, UserReactivated, UserRemoved,
    UserUnlocked, UsernameChanged,
};
use crate::types::{Email, Phone, SecretCode, UserState, Username};
use crate::write_model::UserWriteModel;
use idcore::clock::system_clock;
use idcore::{
    AggregateId, AggregateRef, CommandConfig, CommandError, CommandResult, Commands, EditorUser,
    Event, EventPayload, EventStore, EventStoreError, EventWrites, ExpectedVersion, Operation,
    PendingEvent, ResourceOwner, SharedClock,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

/// Organisation settings the user commands honour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPolicy {
    /// Login names are unique per organisation instead of per instance.
    pub user_login_must_be_domain: bool,
}

/// Input of [`UserCommands::add_human`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddHuman {
    /// Login name.
    pub username: Username,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Shown name; defaults to first and last name.
    pub display_name: Option<String>,
    /// E-mail address.
    pub email: Email,
    /// Phone number.
    pub phone: Option<Phone>,
}

fn not_found(user_id: &AggregateId) -> CommandError {
    CommandError::NotFound(format!("Errors.User.NotFound: {user_id}"))
}

fn precondition(message: &str) -> CommandError {
    CommandError::PreconditionFailed(message.to_string())
}

/// Commands on the user aggregate.
#[derive(Clone)]
pub struct UserCommands<S> {
    commands: Commands<S>,
    policy: UserPolicy,
    clock: SharedClock,
}

impl<S> std::fmt::Debug for UserCommands<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCommands")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<S: EventStore> UserCommands<S> {
    /// Commands over `store`.
    pub fn new(store: S, config: CommandConfig) -> Self {
        Self {
            commands: Commands::new(store, config),
            policy: UserPolicy::default(),
            clock: system_clock(),
        }
    }

    /// Uses `policy` for every command.
    #[must_use]
    pub const fn with_policy(mut self, policy: UserPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Uses `clock` to check code expiry.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// The underlying store.
    pub const fn store(&self) -> &S {
        self.commands.store()
    }

    /// Replays the current state of `user_id`.
    pub async fn user(&self, user_id: &AggregateId) -> CommandResult<UserWriteModel> {
        Ok(self.commands.load(UserWriteModel::new(user_id.clone())).await?.model)
    }

    async fn append<P: EventPayload + Sync>(
        &self,
        aggregate: AggregateRef,
        expected: ExpectedVersion,
        editor: &EditorUser,
        payload: &P,
    ) -> CommandResult<Event> {
        let event = PendingEvent::from_payload(aggregate.clone(), editor.clone(), payload)?;
        let writes = EventWrites::new()
            .with_aggregate(aggregate, expected)
            .with_event(event)
            .build()?;
        let mut events = self.commands.push(writes).await?;
        events.pop().ok_or_else(|| {
            CommandError::EventStore(EventStoreError::internal(
                Operation::Push,
                "push returned no events",
            ))
        })
    }

    /// Loads the existing user, lets `decide` pick the event and appends it.
    async fn apply<P, F>(
        &self,
        user_id: &AggregateId,
        editor: &EditorUser,
        decide: F,
    ) -> CommandResult<Event>
    where
        P: EventPayload + Send + Sync,
        F: Fn(&UserWriteModel) -> CommandResult<P> + Send + Sync,
    {
        let decide = &decide;
        self.commands
            .execute(move || async move {
                let state = self.commands.load(UserWriteModel::new(user_id.clone())).await?;
                let resource_owner = match &state.model.resource_owner {
                    Some(owner) if state.model.exists() => owner.clone(),
                    _ => return Err(not_found(user_id)),
                };
                let payload = decide(&state.model)?;
                self.append(
                    user_aggregate(user_id.clone(), resource_owner),
                    state.expected_version(),
                    editor,
                    &payload,
                )
                .await
            })
            .await
    }

    /// Creates a human user and claims its login name.
    #[instrument(name = "users.add_human", skip(self, human, editor), fields(user_id = %user_id))]
    pub async fn add_human(
        &self,
        user_id: &AggregateId,
        resource_owner: &ResourceOwner,
        human: &AddHuman,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        let payload = HumanAdded {
            username: human.username.clone(),
            first_name: human.first_name.clone(),
            last_name: human.last_name.clone(),
            display_name: human
                .display_name
                .clone()
                .unwrap_or_else(|| format!("{} {}", human.first_name, human.last_name)),
            email: human.email.clone(),
            phone: human.phone.clone(),
            user_login_must_be_domain: self.policy.user_login_must_be_domain,
        };
        let payload = &payload;

        let event = self
            .commands
            .execute(move || async move {
                let state = self.commands.load(UserWriteModel::new(user_id.clone())).await?;
                if !state.is_new() {
                    return Err(CommandError::AlreadyExists(
                        "Errors.User.AlreadyExisting".to_string(),
                    ));
                }
                self.append(
                    user_aggregate(user_id.clone(), resource_owner.clone()),
                    ExpectedVersion::New,
                    editor,
                    payload,
                )
                .await
            })
            .await?;
        info!(sequence = %event.sequence, "user added");
        Ok(event)
    }

    /// Moves the user to a new login name, releasing the old one.
    pub async fn change_username(
        &self,
        user_id: &AggregateId,
        username: &Username,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        let must_be_domain = self.policy.user_login_must_be_domain;
        self.apply(user_id, editor, |user| {
            if user.username.as_ref() == Some(username) {
                return Err(precondition("Errors.User.UsernameNotChanged"));
            }
            Ok(UsernameChanged {
                username: username.clone(),
                old_username: user.username.clone(),
                user_login_must_be_domain: must_be_domain,
            })
        })
        .await
    }

    /// Moves the user off a login name whose domain another organisation
    /// verified.
    pub async fn claim_domain(
        &self,
        user_id: &AggregateId,
        generated: &Username,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        let must_be_domain = self.policy.user_login_must_be_domain;
        self.apply(user_id, editor, |user| {
            Ok(DomainClaimed {
                username: generated.clone(),
                old_username: user.username.clone(),
                user_login_must_be_domain: must_be_domain,
            })
        })
        .await
    }

    /// Records that the domain-claimed notice was delivered.
    pub async fn domain_claimed_sent(
        &self,
        user_id: &AggregateId,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        self.apply(user_id, editor, |_| Ok(DomainClaimedSent)).await
    }

    /// Replaces the e-mail address.
    pub async fn change_email(
        &self,
        user_id: &AggregateId,
        email: &Email,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        self.apply(user_id, editor, |user| {
            if user.email.as_ref() == Some(email) {
                return Err(precondition("Errors.User.Email.NotChanged"));
            }
            Ok(EmailChanged { email: email.clone() })
        })
        .await
    }

    /// Hands out an e-mail verification code.
    pub async fn add_email_code(
        &self,
        user_id: &AggregateId,
        code: &SecretCode,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        self.apply(user_id, editor, |user| {
            if user.is_email_verified {
                return Err(precondition("Errors.User.Email.AlreadyVerified"));
            }
            Ok(EmailCodeAdded { code: code.clone() })
        })
        .await
    }

    /// Records that the e-mail verification code was delivered.
    pub async fn email_code_sent(
        &self,
        user_id: &AggregateId,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        self.apply(user_id, editor, |_| Ok(EmailCodeSent)).await
    }

    /// Verifies the e-mail address with the outstanding code.
    pub async fn verify_email(
        &self,
        user_id: &AggregateId,
        code: &str,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        let now = self.clock.now();
        self.apply(user_id, editor, |user| {
            let pending = user
                .email_code
                .as_ref()
                .ok_or_else(|| precondition("Errors.User.Code.NotFound"))?;
            if !pending.is_valid_at(now) {
                return Err(precondition("Errors.User.Code.Expired"));
            }
            if pending.code.code != code {
                return Err(CommandError::InvalidArgument("Errors.User.Code.Invalid".to_string()));
            }
            Ok(EmailVerified)
        })
        .await
    }

    /// Replaces the phone number.
    pub async fn change_phone(
        &self,
        user_id: &AggregateId,
        phone: &Phone,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        self.apply(user_id, editor, |user| {
            if user.phone.as_ref() == Some(phone) {
                return Err(precondition("Errors.User.Phone.NotChanged"));
            }
            Ok(PhoneChanged { phone: phone.clone() })
        })
        .await
    }

    /// Hands out a phone verification code.
    pub async fn add_phone_code(
        &self,
        user_id: &AggregateId,
        code: &SecretCode,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        self.apply(user_id, editor, |user| {
            if user.phone.is_none() {
                return Err(precondition("Errors.User.Phone.NotFound"));
            }
            Ok(PhoneCodeAdded { code: code.clone() })
        })
        .await
    }

    /// Records that the phone verification code was delivered.
    pub async fn phone_code_sent(
        &self,
        user_id: &AggregateId,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        self.apply(user_id, editor, |_| Ok(PhoneCodeSent)).await
    }

    /// Hands out a password reset code.
    pub async fn add_password_code(
        &self,
        user_id: &AggregateId,
        code: &SecretCode,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        self.apply(user_id, editor, |_| Ok(PasswordCodeAdded { code: code.clone() }))
            .await
    }

    /// Records that the password reset code was delivered.
    pub async fn password_code_sent(
        &self,
        user_id: &AggregateId,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        self.apply(user_id, editor, |_| Ok(PasswordCodeSent)).await
    }

    /// Hands out an initialization code.
    pub async fn add_initial_code(
        &self,
        user_id: &AggregateId,
        code: &SecretCode,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        self.apply(user_id, editor, |_| Ok(InitialCodeAdded { code: code.clone() }))
            .await
    }

    /// Records that the initialization code was delivered.
    pub async fn initial_code_sent(
        &self,
        user_id: &AggregateId,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        self.apply(user_id, editor, |_| Ok(InitialCodeSent)).await
    }

    /// Requests a passwordless registration link, correlated by `id`.
    pub async fn request_passwordless_init_code(
        &self,
        user_id: &AggregateId,
        id: &str,
        code: &SecretCode,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        self.apply(user_id, editor, |_| {
            Ok(PasswordlessInitCodeRequested {
                id: id.to_string(),
                code: code.clone(),
            })
        })
        .await
    }

    /// Records that the registration link `id` was delivered.
    pub async fn passwordless_init_code_sent(
        &self,
        user_id: &AggregateId,
        id: &str,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        self.apply(user_id, editor, |_| Ok(PasswordlessInitCodeSent { id: id.to_string() }))
            .await
    }

    /// Locks an active user.
    pub async fn lock(&self, user_id: &AggregateId, editor: &EditorUser) -> CommandResult<Event> {
        self.apply(user_id, editor, |user| match user.state {
            Some(UserState::Active) => Ok(UserLocked),
            _ => Err(precondition("Errors.User.ShouldBeActive")),
        })
        .await
    }

    /// Unlocks a locked user.
    pub async fn unlock(&self, user_id: &AggregateId, editor: &EditorUser) -> CommandResult<Event> {
        self.apply(user_id, editor, |user| match user.state {
            Some(UserState::Locked) => Ok(UserUnlocked),
            _ => Err(precondition("Errors.User.NotLocked")),
        })
        .await
    }

    /// Deactivates a user that is not already inactive.
    pub async fn deactivate(
        &self,
        user_id: &AggregateId,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        self.apply(user_id, editor, |user| match user.state {
            Some(UserState::Inactive) => Err(precondition("Errors.User.AlreadyInactive")),
            _ => Ok(UserDeactivated),
        })
        .await
    }

    /// Reactivates an inactive user.
    pub async fn reactivate(
        &self,
        user_id: &AggregateId,
        editor: &EditorUser,
    ) -> CommandResult<Event> {
        self.apply(user_id, editor, |user| match user.state {
            Some(UserState::Inactive) => Ok(UserReactivated),
            _ => Err(precondition("Errors.User.NotInactive")),
        })
        .await
    }

    /// Removes the user and releases its login name.
    pub async fn remove(&self, user_id: &AggregateId, editor: &EditorUser) -> CommandResult<Event> {
        let must_be_domain = self.policy.user_login_must_be_domain;
        self.apply(user_id, editor, |user| {
            Ok(UserRemoved {
                username: user.username.clone(),
                user_login_must_be_domain: must_be_domain,
            })
        })
        .await
    }
}
