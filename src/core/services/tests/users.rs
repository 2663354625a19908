use super::*;
use crate::core::models::{Agent, Execution, ProfileUpdate};
use crate::core::services::{ClientDraft, ProductDraft, ServiceError, Source};
use crate::core::status::ExecutionStatus;
use crate::core::store::{AGENTS, EXECUTIONS, USERS};

#[tokio::test]
async fn login_stores_session_and_token() -> TestResult<()> {
    let backend = MockBackend::start().await?;
    let services = services(&backend.config())?;
    assert!(!services.api.has_token());

    let user = services.users().login("sara@example.com", "secret").await?;
    assert_eq!(user.token.as_deref(), Some(TOKEN));
    assert!(services.api.has_token());

    let session = services.users().current_user().await?.unwrap();
    assert_eq!(session.id, USER_ID);
    let record: User = services.store.find(USERS, USER_ID).await?.unwrap();
    assert!(record.token.is_none());

    let (profile, source) = services.users().profile().await?;
    assert_eq!(source, Source::Remote);
    assert_eq!(profile.token.as_deref(), Some(TOKEN));

    assert!(services.users().logout().await?);
    assert!(services.users().current_user().await?.is_none());
    assert!(!services.api.has_token());

    backend.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn wrong_password_is_an_input_error() -> TestResult<()> {
    let backend = MockBackend::start().await?;
    let services = services(&backend.config())?;
    let err = services
        .users()
        .login("sara@example.com", "nope")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(ref m) if m.contains("Invalid email")));
    assert!(services.users().current_user().await?.is_none());

    backend.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn expired_session_is_not_absorbed() -> TestResult<()> {
    let backend = MockBackend::start().await?;
    let services = services(&backend.config())?;
    let mut user = sample_user();
    user.token = Some("stale".into());
    services.store.set_value(SESSION_KEY, &user).await?;
    services.restore_session().await?;

    let err = services.users().profile().await.unwrap_err();
    assert!(matches!(err, ServiceError::Unauthenticated));

    backend.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn offline_stats_are_counted_from_the_cache() -> TestResult<()> {
    let services = services(&offline_config()?)?;
    sign_in(&services).await?;
    for name in ["a", "b"] {
        services.agents().create(name, "Reviewer", None).await?;
    }
    let mut done = Execution::start("a", Some(USER_ID.into()), vec![]);
    done.status = ExecutionStatus::Completed;
    let mut broken = Execution::start("b", Some(USER_ID.into()), vec![]);
    broken.status = ExecutionStatus::Failed;
    let foreign = Execution::start("c", Some("u2".into()), vec![]);
    services
        .store
        .save_all(EXECUTIONS, &[done, broken, foreign])
        .await?;

    let (stats, source) = services.users().stats(USER_ID).await?;
    assert_eq!(source, Source::Cache);
    assert_eq!(stats.total_agents, 2);
    assert_eq!(stats.total_executions, 2);
    assert_eq!(stats.successful_executions, 1);
    assert_eq!(stats.failed_executions, 1);

    let session = services.users().current_user().await?.unwrap();
    assert_eq!(session.stats, stats);
    Ok(())
}

#[tokio::test]
async fn offline_profile_update_is_applied_and_queued() -> TestResult<()> {
    let services = services(&offline_config()?)?;
    sign_in(&services).await?;
    let update = ProfileUpdate {
        name: Some("Sara B".into()),
        ..ProfileUpdate::default()
    };
    let outcome = services.users().update_profile(&update).await?;
    assert!(!outcome.is_synced());
    assert_eq!(outcome.value().name, "Sara B");
    assert_eq!(outcome.value().token.as_deref(), Some(TOKEN));

    let session = services.users().current_user().await?.unwrap();
    assert_eq!(session.name, "Sara B");
    assert_eq!(services.sync().pending().await?.len(), 1);

    let bad = ProfileUpdate {
        email: Some("not-an-email".into()),
        ..ProfileUpdate::default()
    };
    let err = services.users().update_profile(&bad).await.unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(_)));
    Ok(())
}

#[tokio::test]
async fn password_confirmation_must_match() -> TestResult<()> {
    let services = services(&offline_config()?)?;
    sign_in(&services).await?;
    let err = services
        .users()
        .change_password("old", "new-secret", "new-secrte")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(_)));
    Ok(())
}

#[tokio::test]
async fn account_deletion_needs_the_backend() -> TestResult<()> {
    let services = services(&offline_config()?)?;
    sign_in(&services).await?;
    services.agents().create("Agent X", "Reviewer", None).await?;

    let err = services.users().delete_account().await.unwrap_err();
    assert!(matches!(err, ServiceError::Api(_)));
    assert_eq!(services.store.get::<Agent>(AGENTS).await?.len(), 1);
    assert!(services.users().current_user().await?.is_some());
    Ok(())
}

#[tokio::test]
async fn catalog_ids_grow_and_edits_validate() -> TestResult<()> {
    let services = services(&offline_config()?)?;
    let catalog = services.catalog();

    let acme = catalog
        .add_client(&ClientDraft {
            name: Some("Acme".into()),
            email: Some("contact@acme.ma".into()),
            ..ClientDraft::default()
        })
        .await?;
    let globex = catalog
        .add_client(&ClientDraft {
            name: Some("Globex".into()),
            ..ClientDraft::default()
        })
        .await?;
    assert_eq!((acme.id, globex.id), (1, 2));

    let renamed = catalog
        .update_client(
            1,
            &ClientDraft {
                phone: Some("+212 600".into()),
                ..ClientDraft::default()
            },
        )
        .await?;
    assert_eq!(renamed.name, "Acme");
    assert_eq!(renamed.phone, "+212 600");

    catalog.delete_client(1).await?;
    let err = catalog.delete_client(1).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
    let next = catalog
        .add_client(&ClientDraft {
            name: Some("Initech".into()),
            ..ClientDraft::default()
        })
        .await?;
    assert_eq!(next.id, 3);

    let err = catalog
        .add_product(&ProductDraft {
            name: Some("Audit".into()),
            price: Some("cheap".into()),
            ..ProductDraft::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Invalid(_)));
    let product = catalog
        .add_product(&ProductDraft {
            name: Some("Audit".into()),
            price: Some("149.90".into()),
            stock: Some(3),
            ..ProductDraft::default()
        })
        .await?;
    assert_eq!(product.id, 1);
    assert_eq!(catalog.list_products().await?.len(), 1);
    Ok(())
}
