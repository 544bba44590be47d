//! The user projection under the spooler and the queries reading it.

use idcore::query::TextComparison;
use idcore::{
    AggregateId, CommandConfig, EditorUser, EventQuery, EventStore, ProjectionHandler, QueryError,
    ResourceOwner, SearchRequest, Spooler, SpoolerConfig, SubscriptionRegistry,
};
use idcore_iam::{
    AddHuman, Email, Phone, UserCommands, UserProjection, UserQueries, UserSearch, UserState,
    Username, USER_TABLE,
};
use idcore_memory::{InMemoryEventStore, InMemoryHandlerStateStore, InMemoryProjectionDb};
use proptest::prelude::*;
use std::sync::Arc;

struct Fixture {
    store: InMemoryEventStore,
    users: UserCommands<InMemoryEventStore>,
    db: InMemoryProjectionDb,
    state: InMemoryHandlerStateStore,
    handler: ProjectionHandler<UserProjection, InMemoryProjectionDb>,
    spooler: Spooler,
}

impl Fixture {
    fn new() -> Self {
        let store = InMemoryEventStore::new();
        let db = InMemoryProjectionDb::new();
        let state = InMemoryHandlerStateStore::new();
        Self {
            users: UserCommands::new(store.clone(), CommandConfig::default()),
            handler: ProjectionHandler::new(UserProjection, db.clone()),
            spooler: spooler(&store, &state),
            store,
            db,
            state,
        }
    }

    fn queries(&self) -> UserQueries<InMemoryProjectionDb, InMemoryHandlerStateStore> {
        UserQueries::new(self.db.clone(), self.state.clone())
    }

    async fn tick(&self) {
        let report = self.spooler.run_once(&self.handler).await.unwrap();
        assert!(report.is_success(), "tick failed: {report:?}");
    }

    async fn add(&self, id: &str, owner: &str, username: &str) {
        self.users
            .add_human(
                &AggregateId::try_new(id).unwrap(),
                &ResourceOwner::try_new(owner).unwrap(),
                &human(username),
                &admin(),
            )
            .await
            .unwrap();
    }
}

fn spooler(store: &InMemoryEventStore, state: &InMemoryHandlerStateStore) -> Spooler {
    Spooler::new(
        Arc::new(store.clone()),
        Arc::new(state.clone()),
        Arc::new(SubscriptionRegistry::new()),
        SpoolerConfig::default(),
    )
}

fn admin() -> EditorUser {
    EditorUser::new("admin")
}

fn human(username: &str) -> AddHuman {
    AddHuman {
        username: Username::try_new(username).unwrap(),
        first_name: "Gigi".to_string(),
        last_name: "Giraffe".to_string(),
        display_name: Some(format!("{username} Giraffe")),
        email: Email::try_new(format!("{username}@example.com")).unwrap(),
        phone: None,
    }
}

fn id(value: &str) -> AggregateId {
    AggregateId::try_new(value).unwrap()
}

#[tokio::test]
async fn added_users_can_be_read_back() {
    let fixture = Fixture::new();
    fixture.add("u1", "org1", "gigi").await;
    fixture.tick().await;

    let (user, sequence) = fixture.queries().user_by_id(&id("u1")).await.unwrap();

    assert_eq!(user.id, "u1");
    assert_eq!(user.username, "gigi");
    assert_eq!(user.state, UserState::Active);
    assert_eq!(user.email.as_deref(), Some("gigi@example.com"));
    assert_eq!(user.display_name.as_deref(), Some("gigi Giraffe"));
    assert!(!user.is_email_verified);
    assert_eq!(user.creation_date, user.change_date);
    assert_eq!(sequence, fixture.store.latest_sequence(&EventQuery::new()).await.unwrap());
}

#[tokio::test]
async fn changes_are_reflected_in_the_row() {
    // Given: a user whose every attribute changed
    let fixture = Fixture::new();
    fixture.add("u1", "org1", "gigi").await;
    let u1 = id("u1");
    let users = &fixture.users;
    users
        .change_username(&u1, &Username::try_new("gigi2").unwrap(), &admin())
        .await
        .unwrap();
    users
        .change_phone(&u1, &Phone::try_new("+41 79 000 00 00").unwrap(), &admin())
        .await
        .unwrap();
    users.lock(&u1, &admin()).await.unwrap();

    // When: the projection catches up
    fixture.tick().await;

    // Then: the row carries the latest values
    let (user, _) = fixture
        .queries()
        .user_by_username(&Username::try_new("GIGI2").unwrap())
        .await
        .unwrap();
    assert_eq!(user.id, "u1");
    assert_eq!(user.phone.as_deref(), Some("+41 79 000 00 00"));
    assert_eq!(user.state, UserState::Locked);
    assert!(user.change_date >= user.creation_date);
}

#[tokio::test]
async fn a_new_address_resets_verification() {
    let fixture = Fixture::new();
    fixture.add("u1", "org1", "gigi").await;
    let u1 = id("u1");
    let code = idcore_iam::SecretCode::new("123456", std::time::Duration::from_secs(600));
    fixture.users.add_email_code(&u1, &code, &admin()).await.unwrap();
    fixture.users.verify_email(&u1, "123456", &admin()).await.unwrap();
    fixture.tick().await;
    assert!(fixture.queries().user_by_id(&u1).await.unwrap().0.is_email_verified);

    fixture
        .users
        .change_email(&u1, &Email::try_new("new@example.com").unwrap(), &admin())
        .await
        .unwrap();
    fixture.tick().await;

    let (user, _) = fixture.queries().user_by_id(&u1).await.unwrap();
    assert_eq!(user.email.as_deref(), Some("new@example.com"));
    assert!(!user.is_email_verified);
}

#[tokio::test]
async fn removed_users_disappear() {
    let fixture = Fixture::new();
    fixture.add("u1", "org1", "gigi").await;
    fixture.tick().await;

    fixture.users.remove(&id("u1"), &admin()).await.unwrap();
    fixture.tick().await;

    assert!(matches!(
        fixture.queries().user_by_id(&id("u1")).await,
        Err(QueryError::NotFound(_))
    ));
    assert!(fixture.db.rows(USER_TABLE).is_empty());
}

#[tokio::test]
async fn searches_combine_filters_and_report_the_watermark() {
    let fixture = Fixture::new();
    fixture.add("u1", "org1", "gigi").await;
    fixture.add("u2", "org1", "gina").await;
    fixture.add("u3", "org2", "gisela").await;
    fixture.add("u4", "org1", "hugo").await;
    fixture.users.lock(&id("u2"), &admin()).await.unwrap();
    fixture.tick().await;

    let search = UserSearch {
        request: SearchRequest::sorted_by("username", 10),
        username: Some(("GI".to_string(), TextComparison::StartsWithIgnoreCase)),
        states: vec![UserState::Active],
        resource_owner: Some(ResourceOwner::try_new("org1").unwrap()),
        ..UserSearch::default()
    };
    let response = fixture.queries().search_users(&search).await.unwrap();

    let names: Vec<_> = response.items.iter().map(|user| user.username.as_str()).collect();
    assert_eq!(names, vec!["gigi"]);
    assert_eq!(response.count, 1);
    assert_eq!(
        response.latest_sequence,
        fixture.queries().latest_sequence().await.unwrap()
    );
}

#[tokio::test]
async fn paging_counts_every_match() {
    let fixture = Fixture::new();
    for (index, name) in ["anna", "bert", "carl", "dora", "emil"].iter().enumerate() {
        fixture.add(&format!("u{index}"), "org1", name).await;
    }
    fixture.tick().await;

    let search = UserSearch {
        request: SearchRequest {
            offset: 1,
            ..SearchRequest::sorted_by("username", 2)
        },
        ..UserSearch::default()
    };
    let response = fixture.queries().search_users(&search).await.unwrap();

    assert_eq!(response.count, 5);
    let names: Vec<_> = response.items.iter().map(|user| user.username.as_str()).collect();
    assert_eq!(names, vec!["bert", "carl"]);
}

#[derive(Debug, Clone)]
enum Operation {
    Add { user: usize, name: usize },
    Rename { user: usize, name: usize },
    Lock { user: usize },
    Unlock { user: usize },
    Remove { user: usize },
}

const NAMES: [&str; 4] = ["gigi", "gina", "hugo", "emil"];

fn operation() -> impl Strategy<Value = Operation> {
    let user = 0..3_usize;
    let name = 0..NAMES.len();
    prop_oneof![
        (user.clone(), name.clone()).prop_map(|(user, name)| Operation::Add { user, name }),
        (user.clone(), name).prop_map(|(user, name)| Operation::Rename { user, name }),
        user.clone().prop_map(|user| Operation::Lock { user }),
        user.clone().prop_map(|user| Operation::Unlock { user }),
        user.prop_map(|user| Operation::Remove { user }),
    ]
}

async fn perform(users: &UserCommands<InMemoryEventStore>, operation: &Operation) {
    let user_id = |user: &usize| id(&format!("u{user}"));
    // Rejected commands are part of the scenario; only accepted ones produce events.
    let _ = match operation {
        Operation::Add { user, name } => {
            users
                .add_human(
                    &user_id(user),
                    &ResourceOwner::try_new("org1").unwrap(),
                    &human(NAMES[*name]),
                    &admin(),
                )
                .await
        }
        Operation::Rename { user, name } => {
            let username = Username::try_new(NAMES[*name]).unwrap();
            users.change_username(&user_id(user), &username, &admin()).await
        }
        Operation::Lock { user } => users.lock(&user_id(user), &admin()).await,
        Operation::Unlock { user } => users.unlock(&user_id(user), &admin()).await,
        Operation::Remove { user } => users.remove(&user_id(user), &admin()).await,
    };
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn incremental_projection_matches_a_full_replay(
        steps in prop::collection::vec((operation(), any::<bool>()), 1..25)
    ) {
        let (incremental, replayed) = tokio::runtime::Runtime::new().unwrap().block_on(async {
            // Given: a projection ticked at arbitrary points while commands run
            let fixture = Fixture::new();
            for (operation, tick_after) in &steps {
                perform(&fixture.users, operation).await;
                if *tick_after {
                    fixture.tick().await;
                }
            }
            fixture.tick().await;

            // When: a fresh database replays the whole log at once
            let fresh = InMemoryProjectionDb::new();
            let report = spooler(&fixture.store, &InMemoryHandlerStateStore::new())
                .run_once(&ProjectionHandler::new(UserProjection, fresh.clone()))
                .await
                .unwrap();
            assert!(report.is_success());

            (fixture.db.rows(USER_TABLE), fresh.rows(USER_TABLE))
        });

        // Then: both hold the same rows
        prop_assert_eq!(incremental, replayed);
    }
}
