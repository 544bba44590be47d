//! The `projections.users` read model.

use crate::events::{
    DomainClaimed, EmailChanged, EmailVerified, HumanAdded, PhoneChanged, UserDeactivated,
    UserLocked, UserReactivated, UserRemoved, UserUnlocked, UsernameChanged, USER_AGGREGATE,
};
use crate::types::UserState;
use idcore::projection::{AggregateReducer, Column};
use idcore::{Event, EventPayload, Projection, ReduceError, Statement};

/// Table of the user projection.
pub const USER_TABLE: &str = "projections.users";

/// Handler name of the user projection.
pub const USER_PROJECTION: &str = "projections.users";

/// PostgreSQL DDL of [`USER_TABLE`].
pub const USER_TABLE_DDL: &str = "
CREATE TABLE IF NOT EXISTS projections.users (
    aggregate_id TEXT PRIMARY KEY,
    creation_date TIMESTAMPTZ NOT NULL,
    change_date TIMESTAMPTZ NOT NULL,
    sequence BIGINT NOT NULL,
    resource_owner TEXT NOT NULL,
    state BIGINT NOT NULL,
    username TEXT NOT NULL,
    email TEXT,
    is_email_verified BOOLEAN NOT NULL DEFAULT FALSE,
    phone TEXT,
    first_name TEXT,
    last_name TEXT,
    display_name TEXT
);
CREATE INDEX IF NOT EXISTS users_username_idx ON projections.users (username);
CREATE INDEX IF NOT EXISTS users_resource_owner_idx ON projections.users (resource_owner);
";

/// Column names of [`USER_TABLE`].
pub mod columns {
    /// Lifecycle state as number.
    pub const STATE: &str = "state";
    /// Login name.
    pub const USERNAME: &str = "username";
    /// E-mail address.
    pub const EMAIL: &str = "email";
    /// Whether the address is verified.
    pub const IS_EMAIL_VERIFIED: &str = "is_email_verified";
    /// Phone number.
    pub const PHONE: &str = "phone";
    /// Given name.
    pub const FIRST_NAME: &str = "first_name";
    /// Family name.
    pub const LAST_NAME: &str = "last_name";
    /// Shown name.
    pub const DISPLAY_NAME: &str = "display_name";
}

/// One row per existing user.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserProjection;

fn reduce_added(event: &Event) -> Result<Statement, ReduceError> {
    let added: HumanAdded = event.payload_as()?;
    Ok(Statement::create(
        event,
        USER_TABLE,
        vec![
            Column::new(columns::STATE, UserState::Active.as_i64()),
            Column::new(columns::USERNAME, added.username.to_string()),
            Column::new(columns::EMAIL, added.email.to_string()),
            Column::new(columns::IS_EMAIL_VERIFIED, false),
            Column::new(columns::PHONE, added.phone.map(|phone| phone.to_string())),
            Column::new(columns::FIRST_NAME, added.first_name),
            Column::new(columns::LAST_NAME, added.last_name),
            Column::new(columns::DISPLAY_NAME, added.display_name),
        ],
    ))
}

fn reduce_username_changed(event: &Event) -> Result<Statement, ReduceError> {
    let changed: UsernameChanged = event.payload_as()?;
    Ok(Statement::update(
        event,
        USER_TABLE,
        vec![Column::new(columns::USERNAME, changed.username.to_string())],
    ))
}

fn reduce_domain_claimed(event: &Event) -> Result<Statement, ReduceError> {
    let claimed: DomainClaimed = event.payload_as()?;
    Ok(Statement::update(
        event,
        USER_TABLE,
        vec![Column::new(columns::USERNAME, claimed.username.to_string())],
    ))
}

fn reduce_email_changed(event: &Event) -> Result<Statement, ReduceError> {
    let changed: EmailChanged = event.payload_as()?;
    Ok(Statement::update(
        event,
        USER_TABLE,
        vec![
            Column::new(columns::EMAIL, changed.email.to_string()),
            Column::new(columns::IS_EMAIL_VERIFIED, false),
        ],
    ))
}

fn reduce_phone_changed(event: &Event) -> Result<Statement, ReduceError> {
    let changed: PhoneChanged = event.payload_as()?;
    Ok(Statement::update(
        event,
        USER_TABLE,
        vec![Column::new(columns::PHONE, changed.phone.to_string())],
    ))
}

fn state_update(state: UserState) -> impl Fn(&Event) -> Result<Statement, ReduceError> {
    move |event| {
        Ok(Statement::update(
            event,
            USER_TABLE,
            vec![Column::new(columns::STATE, state.as_i64())],
        ))
    }
}

impl Projection for UserProjection {
    fn name(&self) -> &str {
        USER_PROJECTION
    }

    fn table(&self) -> &str {
        USER_TABLE
    }

    fn reducers(&self) -> Vec<AggregateReducer> {
        vec![AggregateReducer::new(USER_AGGREGATE)
            .on(HumanAdded::EVENT_TYPE, reduce_added)
            .on(UsernameChanged::EVENT_TYPE, reduce_username_changed)
            .on(DomainClaimed::EVENT_TYPE, reduce_domain_claimed)
            .on(EmailChanged::EVENT_TYPE, reduce_email_changed)
            .on(EmailVerified::EVENT_TYPE, |event| {
                Ok(Statement::update(
                    event,
                    USER_TABLE,
                    vec![Column::new(columns::IS_EMAIL_VERIFIED, true)],
                ))
            })
            .on(PhoneChanged::EVENT_TYPE, reduce_phone_changed)
            .on(UserLocked::EVENT_TYPE, state_update(UserState::Locked))
            .on(UserUnlocked::EVENT_TYPE, state_update(UserState::Active))
            .on(UserDeactivated::EVENT_TYPE, state_update(UserState::Inactive))
            .on(UserReactivated::EVENT_TYPE, state_update(UserState::Active))
            .on(UserRemoved::EVENT_TYPE, |event| Ok(Statement::delete(event, USER_TABLE)))]
    }
}
