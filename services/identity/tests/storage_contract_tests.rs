//! One behavioural contract, run against every storage backend.
//!
//! The document store runs embedded (`mem://`). The key-value store needs a
//! server; those tests return early unless `REDIS_URL` is set.

use std::sync::Arc;

use identity_service::composer::Backend;
use identity_service::model::{App, CodePurpose, User, UserUpdate, VerificationCode};
use identity_service::storage::{AppStorage, TokenStorage, UserStorage, VerificationCodeStorage};
use identity_service::{DatabaseSettings, DatabaseType, IdentityError};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn s(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

async fn document_backend() -> Backend {
    let name = format!("test_{}", uuid::Uuid::new_v4().simple());
    Backend::connect(&DatabaseSettings::new(DatabaseType::DocumentStore, "mem://", name))
        .await
        .unwrap()
}

async fn keyvalue_backend() -> Option<Backend> {
    let url = std::env::var("REDIS_URL").ok()?;
    let prefix = format!("identity-test-{}", uuid::Uuid::new_v4());
    Some(
        Backend::connect(&DatabaseSettings::new(DatabaseType::KeyValueStore, url, prefix))
            .await
            .unwrap(),
    )
}

async fn app_contract(apps: Arc<dyn AppStorage>) {
    let web = apps
        .add_new_app(App {
            id: "web".into(),
            name: "Web Console".into(),
            active: true,
            scopes: s(&["read"]),
            ..App::default()
        })
        .await
        .unwrap();
    assert_eq!(apps.app_by_id("web").await.unwrap(), web);
    assert!(matches!(
        apps.add_new_app(App {
            id: "web".into(),
            ..App::default()
        })
        .await,
        Err(IdentityError::AppAlreadyExists)
    ));

    let generated = apps
        .add_new_app(App {
            name: "Legacy Desktop".into(),
            ..App::default()
        })
        .await
        .unwrap();
    assert!(!generated.id.is_empty());
    assert!(matches!(
        apps.active_app_by_id(&generated.id).await,
        Err(IdentityError::AppInactive)
    ));
    assert!(apps.active_app_by_id("web").await.is_ok());
    assert!(matches!(apps.app_by_id("missing").await, Err(IdentityError::AppNotFound)));

    let updated = apps
        .update_app("web", App {
            offline: true,
            ..web.clone()
        })
        .await
        .unwrap();
    assert!(updated.offline);
    assert!(apps.app_by_id("web").await.unwrap().offline);
    assert!(matches!(
        apps.update_app("missing", App::default()).await,
        Err(IdentityError::AppNotFound)
    ));

    let page = apps.fetch_apps("console", 0, 10).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id, "web");
    let all = apps.fetch_apps("", 0, 0).await.unwrap();
    assert_eq!(all.total, 2);
    let second = apps.fetch_apps("", 1, 1).await.unwrap();
    assert_eq!(second.total, 2);
    assert_eq!(second.items.len(), 1);
    assert_eq!(second.items[0].id, "web");

    apps.delete_app("web").await.unwrap();
    assert!(matches!(apps.app_by_id("web").await, Err(IdentityError::AppNotFound)));
    assert!(matches!(apps.delete_app("web").await, Err(IdentityError::AppNotFound)));
}

async fn user_contract(users: Arc<dyn UserStorage>) {
    let alice = users
        .add_new_user(
            User {
                username: "alice".into(),
                email: " Alice@Example.com ".into(),
                active: true,
                scopes: s(&["read", "write"]),
                ..User::default()
            },
            "first-password",
        )
        .await
        .unwrap();
    assert!(!alice.id.is_empty());
    assert_eq!(alice.email, "alice@example.com");
    assert_ne!(alice.password_hash, "first-password");

    assert_eq!(users.user_by_id(&alice.id).await.unwrap().username, "alice");
    assert_eq!(users.user_by_email("ALICE@example.com").await.unwrap().id, alice.id);
    assert!(matches!(users.user_by_email("bob@example.com").await, Err(IdentityError::UserNotFound)));
    assert!(users.user_exists("alice").await.unwrap());
    assert!(!users.user_exists("bob").await.unwrap());

    assert_eq!(users.user_by_name_password("alice", "first-password").await.unwrap().id, alice.id);
    assert!(matches!(
        users.user_by_name_password("alice", "wrong").await,
        Err(IdentityError::InvalidCredentials)
    ));
    assert!(matches!(
        users.user_by_name_password("nobody", "first-password").await,
        Err(IdentityError::InvalidCredentials)
    ));

    users.reset_password(&alice.id, "second-password").await.unwrap();
    assert!(users.user_by_name_password("alice", "first-password").await.is_err());
    assert!(users.user_by_name_password("alice", "second-password").await.is_ok());
    assert!(matches!(
        users.reset_password("missing", "x").await,
        Err(IdentityError::UserNotFound)
    ));

    let bob = users
        .add_new_user(
            User {
                username: "bob".into(),
                email: "bob@example.com".into(),
                active: true,
                ..User::default()
            },
            "bob-password",
        )
        .await
        .unwrap();
    assert!(matches!(
        users
            .add_new_user(
                User {
                    username: "alice".into(),
                    ..User::default()
                },
                "x"
            )
            .await,
        Err(IdentityError::UsernameTaken)
    ));
    assert!(matches!(
        users
            .update_user(&bob.id, UserUpdate {
                email: Some("alice@example.com".into()),
                ..UserUpdate::default()
            })
            .await,
        Err(IdentityError::EmailTaken)
    ));

    let renamed = users
        .update_user(&bob.id, UserUpdate {
            username: Some("robert".into()),
            roles: Some(s(&["editor"])),
            ..UserUpdate::default()
        })
        .await
        .unwrap();
    assert_eq!(renamed.username, "robert");
    assert_eq!(users.user_by_id(&bob.id).await.unwrap().roles, s(&["editor"]));

    assert_eq!(users.request_scopes(&alice.id, &[]).await.unwrap(), s(&["read", "write"]));
    assert_eq!(users.request_scopes(&alice.id, &s(&["write", "admin"])).await.unwrap(), s(&["write"]));
    assert!(matches!(
        users.request_scopes(&alice.id, &s(&["admin"])).await,
        Err(IdentityError::ScopeNotAllowed)
    ));

    let page = users.fetch_users("EXAMPLE", 0, 10).await.unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.items[0].username, "alice");

    users.delete_user(&bob.id).await.unwrap();
    assert!(matches!(users.user_by_id(&bob.id).await, Err(IdentityError::UserNotFound)));
    assert!(matches!(users.delete_user(&bob.id).await, Err(IdentityError::UserNotFound)));
}

async fn token_contract(tokens: Arc<dyn TokenStorage>) {
    let later = now() + 3600;

    tokens.put("t1", later).await.unwrap();
    assert!(tokens.is_valid("t1").await.unwrap());
    assert!(!tokens.is_valid("unknown").await.unwrap());

    tokens.redeem("t1", "t2", later).await.unwrap();
    assert!(!tokens.is_valid("t1").await.unwrap());
    assert!(tokens.is_valid("t2").await.unwrap());

    tokens.redeem("t2", "t3", later).await.unwrap();
    assert!(matches!(tokens.redeem("t1", "x", later).await, Err(IdentityError::TokenReused)));
    assert!(!tokens.is_valid("t2").await.unwrap());
    assert!(!tokens.is_valid("t3").await.unwrap());
    assert!(matches!(tokens.redeem("t3", "y", later).await, Err(IdentityError::TokenRevoked)));
    assert!(!tokens.is_valid("x").await.unwrap());

    assert!(matches!(tokens.redeem("unknown", "z", later).await, Err(IdentityError::TokenRevoked)));

    tokens.put("logout", later).await.unwrap();
    tokens.invalidate("logout").await.unwrap();
    assert!(!tokens.is_valid("logout").await.unwrap());
    assert!(matches!(tokens.redeem("logout", "w", later).await, Err(IdentityError::TokenRevoked)));
    tokens.invalidate("never-issued").await.unwrap();

    tokens.put("stale", now() - 10).await.unwrap();
    assert!(!tokens.is_valid("stale").await.unwrap());
    assert!(matches!(
        tokens.redeem("stale", "v", later).await,
        Err(IdentityError::TokenExpired | IdentityError::TokenRevoked)
    ));

    tokens.purge_expired(now()).await.unwrap();
    assert!(!tokens.is_valid("stale").await.unwrap());
    tokens.put("fresh", later).await.unwrap();
    tokens.purge_expired(now()).await.unwrap();
    assert!(tokens.is_valid("fresh").await.unwrap());
}

async fn concurrent_redeem_contract(tokens: Arc<dyn TokenStorage>) {
    let later = now() + 3600;
    tokens.put("race", later).await.unwrap();

    let (a, b) = tokio::join!(tokens.redeem("race", "left", later), tokens.redeem("race", "right", later));
    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|outcome| matches!(outcome, Err(IdentityError::TokenReused | IdentityError::TokenRevoked))));
}

/// Eight racers per round on a multi-threaded runtime: one wins, every
/// loser sees a replay and the winner's successor ends up revoked.
async fn racing_redeem_contract(tokens: Arc<dyn TokenStorage>, rounds: usize) {
    let later = now() + 3600;
    for round in 0..rounds {
        let id = format!("race-{round}");
        tokens.put(&id, later).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|racer| {
                let tokens = Arc::clone(&tokens);
                let id = id.clone();
                let successor = format!("{id}-next-{racer}");
                tokio::spawn(async move { tokens.redeem(&id, &successor, later).await.map(|()| successor) })
            })
            .collect();

        let mut winners = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(successor) => winners.push(successor),
                Err(err) => assert!(matches!(err, IdentityError::TokenReused), "round {round}: {err}"),
            }
        }
        assert_eq!(winners.len(), 1, "round {round}");
        assert!(!tokens.is_valid(&winners[0]).await.unwrap(), "round {round}");
    }
}

async fn racing_signup_contract(users: Arc<dyn UserStorage>) {
    let same_name: Vec<_> = (0..4)
        .map(|racer| {
            let users = Arc::clone(&users);
            tokio::spawn(async move {
                users
                    .add_new_user(
                        User {
                            username: "carol".into(),
                            email: format!("carol{racer}@example.com"),
                            ..User::default()
                        },
                        "pw",
                    )
                    .await
            })
        })
        .collect();
    let mut created = 0;
    for handle in same_name {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(err) => assert!(matches!(err, IdentityError::UsernameTaken), "{err}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(users.fetch_users("carol", 0, 0).await.unwrap().total, 1);

    let same_email: Vec<_> = (0..4)
        .map(|racer| {
            let users = Arc::clone(&users);
            tokio::spawn(async move {
                users
                    .add_new_user(
                        User {
                            username: format!("dave{racer}"),
                            email: "dave@example.com".into(),
                            ..User::default()
                        },
                        "pw",
                    )
                    .await
            })
        })
        .collect();
    let mut created = 0;
    for handle in same_email {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(err) => assert!(matches!(err, IdentityError::EmailTaken), "{err}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(users.fetch_users("dave", 0, 0).await.unwrap().total, 1);
}

/// Blank names never collide, a duplicate id changes nothing, and a rename
/// frees the old name.
async fn user_index_contract(users: Arc<dyn UserStorage>) {
    for _ in 0..2 {
        users
            .add_new_user(
                User {
                    anonymous: true,
                    ..User::default()
                },
                "pw",
            )
            .await
            .unwrap();
    }

    users
        .add_new_user(
            User {
                id: "fixed-id".into(),
                username: "erin".into(),
                ..User::default()
            },
            "pw",
        )
        .await
        .unwrap();
    let duplicate = users
        .add_new_user(
            User {
                id: "fixed-id".into(),
                username: "frank".into(),
                email: "frank@example.com".into(),
                ..User::default()
            },
            "pw",
        )
        .await;
    assert!(matches!(duplicate, Err(IdentityError::Internal(_))));
    assert!(!users.user_exists("frank").await.unwrap());
    assert!(matches!(users.user_by_email("frank@example.com").await, Err(IdentityError::UserNotFound)));
    assert_eq!(users.user_by_id("fixed-id").await.unwrap().username, "erin");

    users
        .update_user("fixed-id", UserUpdate {
            username: Some("erica".into()),
            ..UserUpdate::default()
        })
        .await
        .unwrap();
    assert!(!users.user_exists("erin").await.unwrap());
    assert!(users.user_exists("erica").await.unwrap());
    users
        .add_new_user(
            User {
                username: "erin".into(),
                ..User::default()
            },
            "pw",
        )
        .await
        .unwrap();
}

async fn concurrency_contract(backend: Backend) {
    racing_redeem_contract(backend.token_storage(), 20).await;
    racing_signup_contract(backend.user_storage()).await;
    user_index_contract(backend.user_storage()).await;
}

async fn code_contract(codes: Arc<dyn VerificationCodeStorage>) {
    let code = VerificationCode::generate("user-1", CodePurpose::PasswordReset, 600);
    codes.create_code(code.clone()).await.unwrap();

    let wrong = if code.code == "000000" { "111111" } else { "000000" };
    assert!(matches!(
        codes.consume_code("user-1", CodePurpose::PasswordReset, wrong).await,
        Err(IdentityError::VerificationCodeInvalid)
    ));
    assert!(matches!(
        codes
            .consume_code("user-1", CodePurpose::RegistrationConfirmation, &code.code)
            .await,
        Err(IdentityError::VerificationCodeInvalid)
    ));
    codes
        .consume_code("user-1", CodePurpose::PasswordReset, &code.code)
        .await
        .unwrap();
    assert!(matches!(
        codes.consume_code("user-1", CodePurpose::PasswordReset, &code.code).await,
        Err(IdentityError::VerificationCodeInvalid)
    ));

    let first = VerificationCode::generate("user-2", CodePurpose::RegistrationConfirmation, 600);
    let mut second = VerificationCode::generate("user-2", CodePurpose::RegistrationConfirmation, 600);
    if second.code == first.code {
        second.code = if first.code == "123456" { "654321".into() } else { "123456".into() };
    }
    codes.create_code(first.clone()).await.unwrap();
    codes.create_code(second.clone()).await.unwrap();
    assert!(codes
        .consume_code("user-2", CodePurpose::RegistrationConfirmation, &first.code)
        .await
        .is_err());
    codes
        .consume_code("user-2", CodePurpose::RegistrationConfirmation, &second.code)
        .await
        .unwrap();

    let mut expired = VerificationCode::generate("user-3", CodePurpose::PasswordReset, 600);
    expired.expires_at = now() - 1;
    codes.create_code(expired.clone()).await.unwrap();
    assert!(matches!(
        codes.consume_code("user-3", CodePurpose::PasswordReset, &expired.code).await,
        Err(IdentityError::VerificationCodeInvalid)
    ));
}

async fn full_contract(backend: Backend) {
    app_contract(backend.app_storage()).await;
    user_contract(backend.user_storage()).await;
    token_contract(backend.token_storage()).await;
    concurrent_redeem_contract(backend.token_storage()).await;
    code_contract(backend.verification_code_storage()).await;
}

#[tokio::test]
async fn test_memory_backend_contract() {
    full_contract(Backend::Fake).await;
}

#[tokio::test]
async fn test_document_backend_contract() {
    full_contract(document_backend().await).await;
}

#[tokio::test]
async fn test_keyvalue_backend_contract() {
    let Some(backend) = keyvalue_backend().await else {
        eprintln!("REDIS_URL not set, skipping key-value backend contract");
        return;
    };
    full_contract(backend).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_memory_backend_under_contention() {
    concurrency_contract(Backend::Fake).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_document_backend_under_contention() {
    concurrency_contract(document_backend().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_keyvalue_backend_under_contention() {
    let Some(backend) = keyvalue_backend().await else {
        eprintln!("REDIS_URL not set, skipping key-value backend contention");
        return;
    };
    concurrency_contract(backend).await;
}

#[tokio::test]
async fn test_document_backend_concurrent_redeem_across_handles() {
    let backend = document_backend().await;
    let left = backend.token_storage();
    let right = backend.token_storage();
    let later = now() + 3600;
    left.put("shared", later).await.unwrap();

    let (a, b) = tokio::join!(
        tokio::spawn(async move { left.redeem("shared", "l", later).await }),
        tokio::spawn(async move { right.redeem("shared", "r", later).await }),
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
}
