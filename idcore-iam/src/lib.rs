//! # idcore-iam
//!
//! The identity domain built on idcore: the user aggregate with its unique
//! login names, the commands that change it, the `projections.users` read
//! model with its queries, and the handler that delivers verification codes
//! and notices exactly as often as the log asks for them.
//!
//! ```ignore
//! let store = Arc::new(InMemoryEventStore::new());
//! let users = UserCommands::new(store.clone(), CommandConfig::default());
//! users.add_human(&user_id, &org, &human, &EditorUser::new("admin")).await?;
//!
//! let db = InMemoryProjectionDb::new();
//! let projection = ProjectionHandler::new(UserProjection, db.clone());
//! spooler.run_once(&projection).await?;
//!
//! let queries = UserQueries::new(db, state);
//! let (user, _) = queries.user_by_id(&user_id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod commands;
pub mod events;
pub mod notification;
pub mod projection;
pub mod queries;
pub mod types;
pub mod write_model;

pub use commands::{AddHuman, UserCommands, UserPolicy};
pub use notification::{
    LogNotifier, Notification, NotificationHandler, NotificationKind, Notifier, NotifyError,
    NOTIFICATION_EDITOR, NOTIFICATION_HANDLER,
};
pub use projection::{UserProjection, USER_PROJECTION, USER_TABLE, USER_TABLE_DDL};
pub use queries::{User, UserQueries, UserSearch};
pub use types::{Email, Phone, SecretCode, UserState, Username};
pub use write_model::{PendingCode, UserWriteModel};
