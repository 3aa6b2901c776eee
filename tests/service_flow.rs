//! End-to-end tests for the configuration service over an in-memory database.

use std::sync::Arc;

use age::secrecy::SecretString;
use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use confidant::ConfidantError;
use confidant::crypto::generate_keypair;
use confidant::db::{Repository, init_in_memory};
use confidant::events::{Dispatcher, EventLog, EventQuery, EventStore, EventType};
use confidant::integrations::{
    IntegrationFilter, IntegrationRegistry, IntegrationRepository, IntegrationType,
    MetadataCipher, MetadataStore,
};
use confidant::jobs::{QueueBackend, SendOptions};
use confidant::reconciler::Reconciler;
use confidant::service::{ConfigService, Unlock};
use confidant::versions::HistoryKey;

struct Harness {
    repo: Arc<Repository>,
    metadata: MetadataStore,
    registry: Arc<IntegrationRegistry>,
    service: ConfigService,
}

fn harness() -> Harness {
    let repo = Arc::new(Repository::new(init_in_memory().unwrap()));
    let cipher = Arc::new(MetadataCipher::new(generate_keypair().private));
    let metadata = MetadataStore::new(repo.clone(), cipher);
    let registry = Arc::new(IntegrationRegistry::with_defaults().unwrap());
    let dispatcher = Arc::new(Dispatcher::new(
        EventLog::new(repo.clone()),
        registry.clone(),
        repo.clone(),
        metadata.clone(),
        repo.clone(),
        SendOptions {
            retry_limit: 3,
            retry_backoff_secs: 1,
        },
    ));
    let service = ConfigService::new(repo.clone(), metadata.clone(), dispatcher);
    Harness {
        repo,
        metadata,
        registry,
        service,
    }
}

fn passphrase() -> SecretString {
    SecretString::from("correct horse".to_string())
}

fn event_types(repo: &Repository, target_id: &str) -> Vec<EventType> {
    let mut events = repo
        .list_events(&EventQuery {
            target_id: Some(target_id.to_string()),
            ..Default::default()
        })
        .unwrap();
    events.reverse();
    events.into_iter().map(|e| e.event_type).collect()
}

#[tokio::test]
async fn test_secret_is_sealed_and_revealed() {
    let h = harness();
    let created = h
        .service
        .create_project("ws", "Billing API", "alice", Some(passphrase()))
        .await
        .unwrap();
    assert_eq!(created.project.slug, "billing-api");
    assert!(created.project.store_private_key);
    assert!(created.default_environment.is_default);

    let env_id = created.default_environment.id.clone();
    let secret = h
        .service
        .create_secret(
            &created.project.id,
            "DATABASE_URL",
            &[(env_id.clone(), "postgres://db".to_string())],
            "alice",
        )
        .await
        .unwrap();

    let stored = h
        .service
        .versions()
        .get_current(&HistoryKey::new(&secret.id, &env_id))
        .unwrap()
        .unwrap();
    assert_ne!(stored.value, "postgres://db");

    let by_passphrase = h
        .service
        .reveal_secret(&secret.id, &env_id, Unlock::Passphrase(passphrase()))
        .unwrap();
    assert_eq!(by_passphrase.as_deref(), Some("postgres://db"));

    let by_key = h
        .service
        .reveal_secret(&secret.id, &env_id, Unlock::Key(created.private_key.clone()))
        .unwrap();
    assert_eq!(by_key.as_deref(), Some("postgres://db"));

    let wrong_key = h
        .service
        .reveal_secret(&secret.id, &env_id, Unlock::Key(generate_keypair().private));
    assert!(matches!(wrong_key, Err(ConfidantError::Decryption(_))));

    // secrets are not readable as plain variables
    assert!(matches!(
        h.service.current_value(&secret.id, &env_id),
        Err(ConfidantError::Validation(_))
    ));
    assert_eq!(event_types(&h.repo, &secret.id), vec![EventType::SecretAdded]);
}

#[tokio::test]
async fn test_passphrase_unlock_needs_a_stored_key() {
    let h = harness();
    let created = h.service.create_project("ws", "web", "alice", None).await.unwrap();
    let env_id = created.default_environment.id.clone();
    let secret = h
        .service
        .create_secret(&created.project.id, "TOKEN", &[(env_id.clone(), "t".to_string())], "alice")
        .await
        .unwrap();

    let result = h
        .service
        .reveal_secret(&secret.id, &env_id, Unlock::Passphrase(passphrase()));
    assert!(matches!(result, Err(ConfidantError::Validation(_))));
}

#[tokio::test]
async fn test_variable_updates_and_rollback() {
    let h = harness();
    let created = h.service.create_project("ws", "web", "alice", None).await.unwrap();
    let env_id = created.default_environment.id.clone();
    let variable = h
        .service
        .create_variable(&created.project.id, "LOG_LEVEL", &[(env_id.clone(), "info".to_string())], "alice")
        .await
        .unwrap();

    h.service.set_value(&variable.id, &env_id, "debug", "bob").await.unwrap();
    let third = h.service.set_value(&variable.id, &env_id, "trace", "bob").await.unwrap();
    assert_eq!(third.version_number, 3);
    assert_eq!(
        h.service.current_value(&variable.id, &env_id).unwrap().as_deref(),
        Some("trace")
    );

    let outcome = h.service.rollback(&variable.id, &env_id, 1, "bob").await.unwrap();
    assert_eq!((outcome.applied, outcome.current), (1, 2));
    assert_eq!(
        h.service.current_value(&variable.id, &env_id).unwrap().as_deref(),
        Some("debug")
    );

    // clamped at version 1
    let outcome = h.service.rollback(&variable.id, &env_id, 5, "bob").await.unwrap();
    assert_eq!((outcome.applied, outcome.current), (1, 1));

    // nothing left to roll back: no event
    let outcome = h.service.rollback(&variable.id, &env_id, 1, "bob").await.unwrap();
    assert_eq!(outcome.applied, 0);

    // history is never rewritten by a rollback
    let history = h
        .service
        .versions()
        .history(&HistoryKey::new(&variable.id, &env_id))
        .unwrap();
    assert_eq!(history.len(), 3);

    assert_eq!(
        event_types(&h.repo, &variable.id),
        vec![
            EventType::VariableAdded,
            EventType::VariableUpdated,
            EventType::VariableUpdated,
            EventType::VariableUpdated,
            EventType::VariableUpdated,
        ]
    );
}

#[tokio::test]
async fn test_disable_and_delete_variable() {
    let h = harness();
    let created = h.service.create_project("ws", "web", "alice", None).await.unwrap();
    let env_id = created.default_environment.id.clone();
    let variable = h
        .service
        .create_variable(&created.project.id, "PORT", &[(env_id.clone(), "8080".to_string())], "alice")
        .await
        .unwrap();
    let key = HistoryKey::new(&variable.id, &env_id);

    h.service.set_enabled(&variable.id, &env_id, false, "alice").await.unwrap();
    assert!(!h.service.versions().is_enabled(&key).unwrap());

    h.service.delete_entity(&variable.id, "alice").await.unwrap();
    assert!(!h.service.versions().exists(&key).unwrap());
    assert!(matches!(
        h.service.current_value(&variable.id, &env_id),
        Err(ConfidantError::NotFound(_))
    ));
    assert_eq!(
        event_types(&h.repo, &variable.id),
        vec![
            EventType::VariableAdded,
            EventType::VariableUpdated,
            EventType::VariableDeleted,
        ]
    );
}

#[tokio::test]
async fn test_environment_rules() {
    let h = harness();
    let created = h.service.create_project("ws", "web", "alice", None).await.unwrap();
    let project_id = created.project.id.clone();

    let second_default = h
        .service
        .create_environment(&project_id, "Production", true, "alice")
        .await;
    assert!(matches!(second_default, Err(ConfidantError::AlreadyExists(_))));

    let delete_default = h
        .service
        .delete_environment(&created.default_environment.id, "alice")
        .await;
    assert!(matches!(delete_default, Err(ConfidantError::Validation(_))));

    let staging = h
        .service
        .create_environment(&project_id, "Staging", false, "alice")
        .await
        .unwrap();
    assert_eq!(staging.slug, "staging");

    let variable = h
        .service
        .create_variable(&project_id, "REPLICAS", &[(staging.id.clone(), "2".to_string())], "alice")
        .await
        .unwrap();

    h.service.delete_environment(&staging.id, "alice").await.unwrap();
    assert!(
        !h.service
            .versions()
            .exists(&HistoryKey::new(&variable.id, &staging.id))
            .unwrap()
    );
    assert_eq!(
        event_types(&h.repo, &staging.id),
        vec![EventType::EnvironmentAdded, EventType::EnvironmentDeleted]
    );
}

#[tokio::test]
async fn test_values_only_target_the_entity_project() {
    let h = harness();
    let web = h.service.create_project("ws", "web", "alice", None).await.unwrap();
    let api = h.service.create_project("ws", "api", "alice", None).await.unwrap();

    let result = h
        .service
        .create_variable(
            &web.project.id,
            "HOST",
            &[(api.default_environment.id.clone(), "x".to_string())],
            "alice",
        )
        .await;
    assert!(matches!(result, Err(ConfidantError::NotFound(_))));
}

#[tokio::test]
async fn test_failed_create_leaves_nothing_behind() {
    let h = harness();
    let web = h.service.create_project("ws", "web", "alice", None).await.unwrap();
    let api = h.service.create_project("ws", "api", "alice", None).await.unwrap();
    let env_id = web.default_environment.id.clone();

    let repeated = h
        .service
        .create_variable(
            &web.project.id,
            "HOST",
            &[(env_id.clone(), "a".to_string()), (env_id.clone(), "b".to_string())],
            "alice",
        )
        .await;
    assert!(matches!(repeated, Err(ConfidantError::Validation(_))));

    let foreign = h
        .service
        .create_variable(
            &web.project.id,
            "HOST",
            &[
                (env_id.clone(), "a".to_string()),
                (api.default_environment.id.clone(), "b".to_string()),
            ],
            "alice",
        )
        .await;
    assert!(matches!(foreign, Err(ConfidantError::NotFound(_))));

    assert!(h.repo.list_entities(&web.project.id).unwrap().is_empty());
    let events = h
        .repo
        .list_events(&EventQuery {
            workspace_id: Some("ws".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert!(events.iter().all(|e| e.event_type == EventType::ProjectAdded));

    // the name is still free and the history starts at version 1
    let variable = h
        .service
        .create_variable(&web.project.id, "HOST", &[(env_id.clone(), "a".to_string())], "alice")
        .await
        .unwrap();
    let history = h
        .service
        .versions()
        .history(&HistoryKey::new(&variable.id, &env_id))
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version_number, 1);
}

#[tokio::test]
async fn test_integration_config_is_validated() {
    let h = harness();
    let result = h
        .service
        .create_integration(
            "ws",
            IntegrationType::Slack,
            "alerts",
            json!({"webhookUrl": "not-a-url"}),
            vec![],
            "alice",
        )
        .await;
    assert!(matches!(result, Err(ConfidantError::Validation(_))));
    assert!(h.repo.find_integrations(&IntegrationFilter::all()).unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_delivery_is_queued_and_reconciled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness();
    let created = h.service.create_project("ws", "web", "alice", None).await.unwrap();
    let env_id = created.default_environment.id.clone();
    let variable = h
        .service
        .create_variable(&created.project.id, "MODE", &[(env_id.clone(), "a".to_string())], "alice")
        .await
        .unwrap();
    let integration = h
        .service
        .create_integration(
            "ws",
            IntegrationType::Webhook,
            "ops",
            json!({"url": format!("{}/hook", server.uri())}),
            vec![EventType::VariableUpdated],
            "alice",
        )
        .await
        .unwrap();

    h.service.set_value(&variable.id, &env_id, "b", "bob").await.unwrap();

    let (_, stored) = h.metadata.load(&integration.id).unwrap();
    assert_eq!(stored.pending_cleanup.len(), 1);
    assert_eq!(stored.pending_cleanup[0].target_id, variable.id);
    assert_eq!(stored.pending_cleanup[0].action, EventType::VariableUpdated);

    // the guaranteed delivery is waiting on the webhook queue
    let job = h
        .repo
        .fetch(&IntegrationType::Webhook.queue_name(), Utc::now())
        .unwrap()
        .expect("delivery job");
    assert_eq!(job.payload["integrationId"], json!(integration.id));

    let reconciler = Reconciler::new(h.repo.clone(), h.metadata.clone(), h.registry.clone(), 3);
    let report = reconciler.run_once().await.unwrap();
    assert_eq!(report.resolved, 1);
    assert_eq!(report.writes, 1);

    let (_, stored) = h.metadata.load(&integration.id).unwrap();
    assert!(stored.pending_cleanup.is_empty());
    assert_eq!(
        stored.config["url"],
        json!(format!("{}/hook", server.uri()))
    );
}
