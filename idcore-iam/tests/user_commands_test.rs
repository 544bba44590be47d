//! User commands against the in-memory store: login name uniqueness, state
//! preconditions and code verification.

use chrono::Duration;
use idcore::{AggregateId, CommandConfig, CommandError, EditorUser, ResourceOwner};
use idcore_iam::events::USERNAME_TAKEN;
use idcore_iam::{AddHuman, Email, SecretCode, UserCommands, UserPolicy, UserState, Username};
use idcore_memory::InMemoryEventStore;
use idcore_testing::ManualClock;
use std::sync::Arc;

fn id(value: &str) -> AggregateId {
    AggregateId::try_new(value).unwrap()
}

fn org(value: &str) -> ResourceOwner {
    ResourceOwner::try_new(value).unwrap()
}

fn name(value: &str) -> Username {
    Username::try_new(value).unwrap()
}

fn admin() -> EditorUser {
    EditorUser::new("admin")
}

fn human(username: &str) -> AddHuman {
    AddHuman {
        username: name(username),
        first_name: "Gigi".to_string(),
        last_name: "Giraffe".to_string(),
        display_name: None,
        email: Email::try_new(format!("{username}@example.com")).unwrap(),
        phone: None,
    }
}

fn users() -> UserCommands<InMemoryEventStore> {
    UserCommands::new(InMemoryEventStore::new(), CommandConfig::default())
}

fn is_username_taken(result: Result<idcore::Event, CommandError>) -> bool {
    matches!(result, Err(CommandError::AlreadyExists(message)) if message == USERNAME_TAKEN)
}

#[tokio::test]
async fn login_names_are_unique_across_users() {
    let users = users();
    users
        .add_human(&id("u1"), &org("org1"), &human("gigi"), &admin())
        .await
        .unwrap();

    let second = users
        .add_human(&id("u2"), &org("org2"), &human("gigi"), &admin())
        .await;

    assert!(is_username_taken(second));
}

#[tokio::test]
async fn a_released_name_can_be_claimed_again() {
    // Given: u1 renamed from gigi to gigi2
    let users = users();
    users
        .add_human(&id("u1"), &org("org1"), &human("gigi"), &admin())
        .await
        .unwrap();
    users
        .change_username(&id("u1"), &name("gigi2"), &admin())
        .await
        .unwrap();

    // When/Then: the old name is free and the new one is taken
    users
        .add_human(&id("u2"), &org("org1"), &human("gigi"), &admin())
        .await
        .unwrap();
    assert!(is_username_taken(
        users
            .add_human(&id("u3"), &org("org1"), &human("gigi2"), &admin())
            .await
    ));
}

#[tokio::test]
async fn removing_a_user_frees_its_name() {
    let users = users();
    users
        .add_human(&id("u1"), &org("org1"), &human("gigi"), &admin())
        .await
        .unwrap();

    users.remove(&id("u1"), &admin()).await.unwrap();

    users
        .add_human(&id("u2"), &org("org1"), &human("gigi"), &admin())
        .await
        .unwrap();
    assert!(!users.user(&id("u1")).await.unwrap().exists());
}

#[tokio::test]
async fn domain_scoped_names_are_unique_per_organisation() {
    let users = users().with_policy(UserPolicy {
        user_login_must_be_domain: true,
    });
    users
        .add_human(&id("u1"), &org("org1"), &human("gigi"), &admin())
        .await
        .unwrap();

    users
        .add_human(&id("u2"), &org("org2"), &human("gigi"), &admin())
        .await
        .unwrap();
    assert!(is_username_taken(
        users
            .add_human(&id("u3"), &org("org1"), &human("gigi"), &admin())
            .await
    ));
}

#[tokio::test]
async fn a_claimed_domain_moves_the_user_to_the_generated_name() {
    let users = users();
    users
        .add_human(&id("u1"), &org("org1"), &human("gigi@zoo.ch"), &admin())
        .await
        .unwrap();

    users
        .claim_domain(&id("u1"), &name("u1@temporary.zoo"), &admin())
        .await
        .unwrap();

    let user = users.user(&id("u1")).await.unwrap();
    assert_eq!(user.username, Some(name("u1@temporary.zoo")));
    users
        .add_human(&id("u2"), &org("org2"), &human("gigi@zoo.ch"), &admin())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_claims_of_one_name_admit_exactly_one() {
    let users = users();

    let tasks: Vec<_> = (0..8)
        .map(|index| {
            let users = users.clone();
            tokio::spawn(async move {
                users
                    .add_human(&id(&format!("u{index}")), &org("org1"), &human("gigi"), &admin())
                    .await
            })
        })
        .collect();

    let mut created = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => created += 1,
            result => {
                assert!(is_username_taken(result));
                rejected += 1;
            }
        }
    }
    assert_eq!((created, rejected), (1, 7));
}

#[tokio::test]
async fn an_existing_user_id_cannot_be_added_twice() {
    let users = users();
    users
        .add_human(&id("u1"), &org("org1"), &human("gigi"), &admin())
        .await
        .unwrap();

    let again = users
        .add_human(&id("u1"), &org("org1"), &human("gigi2"), &admin())
        .await;

    assert!(matches!(
        again,
        Err(CommandError::AlreadyExists(message)) if message != USERNAME_TAKEN
    ));
}

#[tokio::test]
async fn commands_on_unknown_users_are_not_found() {
    let users = users();

    assert!(matches!(
        users.lock(&id("nobody"), &admin()).await,
        Err(CommandError::NotFound(_))
    ));
}

#[tokio::test]
async fn state_changes_follow_the_lifecycle() {
    let users = users();
    let u1 = id("u1");
    users
        .add_human(&u1, &org("org1"), &human("gigi"), &admin())
        .await
        .unwrap();

    assert!(matches!(
        users.unlock(&u1, &admin()).await,
        Err(CommandError::PreconditionFailed(_))
    ));
    users.lock(&u1, &admin()).await.unwrap();
    assert_eq!(users.user(&u1).await.unwrap().state, Some(UserState::Locked));
    users.unlock(&u1, &admin()).await.unwrap();
    users.deactivate(&u1, &admin()).await.unwrap();
    assert!(matches!(
        users.deactivate(&u1, &admin()).await,
        Err(CommandError::PreconditionFailed(_))
    ));
    users.reactivate(&u1, &admin()).await.unwrap();
    assert_eq!(users.user(&u1).await.unwrap().state, Some(UserState::Active));
}

#[tokio::test]
async fn email_codes_verify_until_they_expire() {
    // Given: a store and commands sharing one manual clock
    let clock = Arc::new(ManualClock::starting_now());
    let store = InMemoryEventStore::new().with_clock(clock.clone());
    let users = UserCommands::new(store, CommandConfig::default()).with_clock(clock.clone());
    let u1 = id("u1");
    users
        .add_human(&u1, &org("org1"), &human("gigi"), &admin())
        .await
        .unwrap();
    let code = SecretCode::new("123456", std::time::Duration::from_secs(600));
    users.add_email_code(&u1, &code, &admin()).await.unwrap();

    // Then: a wrong code is rejected and the right one verifies
    assert!(matches!(
        users.verify_email(&u1, "000000", &admin()).await,
        Err(CommandError::InvalidArgument(_))
    ));
    users.verify_email(&u1, "123456", &admin()).await.unwrap();
    assert!(users.user(&u1).await.unwrap().is_email_verified);

    // And: after an address change, a stale code has expired
    users
        .change_email(&u1, &Email::try_new("new@example.com").unwrap(), &admin())
        .await
        .unwrap();
    users.add_email_code(&u1, &code, &admin()).await.unwrap();
    clock.advance(Duration::minutes(11));
    assert!(matches!(
        users.verify_email(&u1, "123456", &admin()).await,
        Err(CommandError::PreconditionFailed(message)) if message == "Errors.User.Code.Expired"
    ));
}

#[tokio::test]
async fn codes_with_unbounded_lifetimes_stay_verifiable() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = InMemoryEventStore::new().with_clock(clock.clone());
    let users = UserCommands::new(store, CommandConfig::default()).with_clock(clock.clone());
    let u1 = id("u1");
    users
        .add_human(&u1, &org("org1"), &human("gigi"), &admin())
        .await
        .unwrap();
    let code = SecretCode::new("abc", std::time::Duration::from_secs(10_000_000_000_000));
    users.add_email_code(&u1, &code, &admin()).await.unwrap();
    clock.advance(Duration::days(365));

    users.verify_email(&u1, "abc", &admin()).await.unwrap();

    assert!(users.user(&u1).await.unwrap().is_email_verified);
}
