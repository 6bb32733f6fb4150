//! Bootstrap Flow Tests
//!
//! End-to-end tests of the authenticate / deauthenticate / discover /
//! broker operations against a mock portal, an in-memory credential
//! document and a recording broker transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use vrm_sdk::storage::{MemoryStorage, StorageBackend};
use vrm_sdk::vrm_api::broker::ConnectFuture;
use vrm_sdk::vrm_api::credentials::DEFAULT_DOCUMENT_PATH;
use vrm_sdk::{
    Bootstrap, BrokerSessionCredential, BrokerTransport, CredentialStore, DocumentStore,
    StatusEvent, VrmClient, VrmError, VrmEvent,
};
use wiremock::{
    matchers::{body_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

// ============================================================================
// Test doubles
// ============================================================================

#[derive(Debug)]
struct FakeConnection {
    address: String,
    port: u16,
    credential: BrokerSessionCredential,
}

#[derive(Clone, Default)]
struct RecordingTransport {
    attempts: Arc<AtomicUsize>,
    refuse: bool,
}

impl RecordingTransport {
    fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl BrokerTransport for RecordingTransport {
    type Connection = FakeConnection;

    fn connect<'a>(
        &'a self,
        address: &'a str,
        port: u16,
        credential: BrokerSessionCredential,
    ) -> ConnectFuture<'a, FakeConnection> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(VrmError::Auth("Broker refused connection".to_string()));
            }
            Ok(FakeConnection {
                address: address.to_string(),
                port,
                credential,
            })
        })
    }
}

struct Harness {
    server: MockServer,
    storage: MemoryStorage,
    transport: RecordingTransport,
    vrm: Bootstrap<DocumentStore<MemoryStorage>, RecordingTransport>,
    events: UnboundedReceiver<VrmEvent>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_transport(RecordingTransport::default()).await
    }

    async fn with_transport(transport: RecordingTransport) -> Self {
        let server = MockServer::start().await;
        let storage = MemoryStorage::new();
        let (tx, events) = unbounded_channel();
        let vrm = Bootstrap::new(
            VrmClient::new(server.uri()),
            DocumentStore::new(storage.clone()),
            transport.clone(),
        )
        .with_events(tx);

        Self {
            server,
            storage,
            transport,
            vrm,
            events,
        }
    }

    async fn seed(&self, document: Value) {
        self.storage
            .write(
                DEFAULT_DOCUMENT_PATH,
                &serde_json::to_vec_pretty(&document).unwrap(),
            )
            .await
            .unwrap();
    }

    fn raw_document(&self) -> Option<Vec<u8>> {
        self.storage.get(DEFAULT_DOCUMENT_PATH)
    }

    fn document(&self) -> Value {
        serde_json::from_slice(&self.raw_document().expect("document written")).unwrap()
    }

    async fn request_count(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map(|requests| requests.len())
            .unwrap_or(0)
    }

    fn statuses(&mut self) -> Vec<StatusEvent> {
        let mut statuses = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let VrmEvent::Status(status) = event {
                statuses.push(status);
            }
        }
        statuses
    }

    fn discovered(&mut self) -> Vec<Vec<String>> {
        let mut batches = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let VrmEvent::Discovered(installations) = event {
                batches.push(installations.into_iter().map(|i| i.portal_id).collect());
            }
        }
        batches
    }
}

fn logged_in_document() -> Value {
    json!({
        "secrets": {
            "adminUser": "admin",
            "vrmToken": "access-xyz",
            "vrmTokenId": "901",
            "vrmUserId": "22",
            "vrmUsername": "user@example.com"
        },
        "settings": {"vrm": {"enabledPortalIds": ["A"]}}
    })
}

async fn mount_login(server: &MockServer) {
    Mock::given(method("PUT"))
        .and(path("/v2/auth/login"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"token": "session-abc", "idUser": 22})),
        )
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_installations(server: &MockServer, ids: &[&str], expected_calls: u64) {
    let records: Vec<Value> = ids
        .iter()
        .map(|id| json!({"identifier": id, "name": format!("Site {}", id)}))
        .collect();

    Mock::given(method("GET"))
        .and(path("/v2/users/22/installations"))
        .and(header("X-Authorization", "Token access-xyz"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"success": true, "records": records})),
        )
        .expect(expected_calls)
        .mount(server)
        .await;
}

// ============================================================================
// Authenticate
// ============================================================================

#[tokio::test]
async fn test_authenticate_empty_token_name_makes_no_network_call() {
    let mut h = Harness::new().await;

    let result = h.vrm.authenticate("user@example.com", "secret", "").await;

    assert!(matches!(result, Err(VrmError::Validation(_))));
    assert_eq!(h.request_count().await, 0);
    assert!(h.raw_document().is_none());

    let statuses = h.statuses();
    assert_eq!(statuses.len(), 1);
    assert!(!statuses[0].is_success());
    assert_eq!(statuses[0].message, "Please enter a token name");
}

#[tokio::test]
async fn test_authenticate_only_rejects_the_empty_token_name() {
    let h = Harness::new().await;

    Mock::given(method("PUT"))
        .and(path("/v2/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "success": false,
            "errors": "Username or password is incorrect"
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    let result = h.vrm.authenticate("user@example.com", "secret", " ").await;

    assert!(matches!(result, Err(VrmError::Auth(_))));
    assert_eq!(h.request_count().await, 1);
}

#[tokio::test]
async fn test_authenticate_login_failure_leaves_store_untouched() {
    let mut h = Harness::new().await;
    h.seed(json!({"secrets": {"adminUser": "admin"}})).await;
    let before = h.raw_document();

    Mock::given(method("PUT"))
        .and(path("/v2/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "success": false,
            "errors": "Username or password is incorrect"
        })))
        .mount(&h.server)
        .await;

    let result = h.vrm.authenticate("user@example.com", "wrong", "signalk").await;

    assert!(matches!(result, Err(VrmError::Auth(_))));
    assert_eq!(h.raw_document(), before);

    let statuses = h.statuses();
    let last = statuses.last().unwrap();
    assert!(!last.is_success());
    assert_eq!(last.message, "Username or password is incorrect");
}

#[tokio::test]
async fn test_authenticate_token_creation_failure_leaves_store_untouched() {
    let mut h = Harness::new().await;
    h.seed(json!({"secrets": {"adminUser": "admin"}, "settings": {}})).await;
    let before = h.raw_document();

    mount_login(&h.server).await;
    Mock::given(method("POST"))
        .and(path("/v2/users/22/accesstokens/create"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "success": false,
            "errors": {"name": "An access token with this name already exists"}
        })))
        .expect(1)
        .mount(&h.server)
        .await;
    mount_installations(&h.server, &[], 0).await;

    let result = h.vrm.authenticate("user@example.com", "secret", "signalk").await;

    assert!(matches!(result, Err(VrmError::Auth(_))));
    assert_eq!(h.raw_document(), before);

    let statuses = h.statuses();
    assert_eq!(
        statuses.last().unwrap().message,
        "An access token with this name already exists"
    );
}

#[tokio::test]
async fn test_authenticate_success_stores_record_and_discovers_once() {
    let mut h = Harness::new().await;
    h.seed(json!({"secrets": {"adminUser": "admin"}})).await;

    mount_login(&h.server).await;
    Mock::given(method("POST"))
        .and(path("/v2/users/22/accesstokens/create"))
        .and(header("X-Authorization", "Bearer session-abc"))
        .and(body_json(json!({"name": "signalk"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "token": "access-xyz",
            "idAccessToken": 901
        })))
        .expect(1)
        .mount(&h.server)
        .await;
    mount_installations(&h.server, &["A", "B"], 1).await;

    let record = h
        .vrm
        .authenticate("user@example.com", "secret", "signalk")
        .await
        .unwrap();

    assert_eq!(record.access_token, "access-xyz");
    assert_eq!(record.token_id, "901");
    assert_eq!(record.account_id, "22");
    assert_eq!(record.username, "user@example.com");

    let document = h.document();
    assert_eq!(
        document["secrets"],
        json!({
            "adminUser": "admin",
            "vrmToken": "access-xyz",
            "vrmTokenId": "901",
            "vrmUserId": "22",
            "vrmUsername": "user@example.com"
        })
    );

    assert_eq!(h.vrm.credentials().await.unwrap(), Some(record));
    assert!(h.vrm.is_authenticated().await.unwrap());

    let messages: Vec<String> = h.statuses().into_iter().map(|s| s.message).collect();
    assert_eq!(
        messages,
        vec![
            "Logging in",
            "Token created",
            "Getting installations",
            "Installations retrieved"
        ]
    );
}

#[tokio::test]
async fn test_authenticate_empty_access_token_is_not_persisted() {
    let mut h = Harness::new().await;
    h.seed(json!({"secrets": {"adminUser": "admin"}})).await;
    let before = h.raw_document();

    mount_login(&h.server).await;
    Mock::given(method("POST"))
        .and(path("/v2/users/22/accesstokens/create"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"token": "", "idAccessToken": 901})),
        )
        .mount(&h.server)
        .await;
    mount_installations(&h.server, &[], 0).await;

    let result = h.vrm.authenticate("user@example.com", "secret", "signalk").await;

    assert!(matches!(result, Err(VrmError::Network(_))));
    assert_eq!(h.raw_document(), before);
    assert!(!h.statuses().last().unwrap().is_success());
}

#[tokio::test]
async fn test_authenticate_persistence_failure_skips_discovery() {
    let mut h = Harness::new().await;
    h.seed(json!({"secrets": {}})).await;
    let before = h.raw_document();
    h.storage.set_read_only(true);

    mount_login(&h.server).await;
    Mock::given(method("POST"))
        .and(path("/v2/users/22/accesstokens/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "access-xyz",
            "idAccessToken": 901
        })))
        .mount(&h.server)
        .await;
    mount_installations(&h.server, &[], 0).await;

    let result = h.vrm.authenticate("user@example.com", "secret", "signalk").await;

    assert!(matches!(result, Err(VrmError::Persistence(_))));
    assert_eq!(h.raw_document(), before);

    let statuses = h.statuses();
    let last = statuses.last().unwrap();
    assert!(!last.is_success());
    assert!(last.message.contains("'signalk'"));
}

#[tokio::test]
async fn test_authenticate_discovery_failure_keeps_login() {
    let mut h = Harness::new().await;

    mount_login(&h.server).await;
    Mock::given(method("POST"))
        .and(path("/v2/users/22/accesstokens/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "access-xyz",
            "idAccessToken": 901
        })))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/users/22/installations"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(1)
        .mount(&h.server)
        .await;

    let result = h.vrm.authenticate("user@example.com", "secret", "signalk").await;

    assert!(result.is_ok());
    assert!(h.vrm.is_authenticated().await.unwrap());
    assert!(!h.statuses().last().unwrap().is_success());
}

// ============================================================================
// Deauthenticate
// ============================================================================

#[tokio::test]
async fn test_deauthenticate_when_logged_out_is_noop() {
    let mut h = Harness::new().await;

    h.vrm.deauthenticate().await.unwrap();
    h.vrm.deauthenticate().await.unwrap();

    assert!(h.raw_document().is_none());
    assert_eq!(h.request_count().await, 0);
    assert!(h.statuses().iter().all(|s| s.is_success()));
}

#[tokio::test]
async fn test_deauthenticate_removes_only_credential_fields() {
    let h = Harness::new().await;
    h.seed(json!({
        "secrets": {
            "adminUser": "admin",
            "vrmToken": "access-xyz",
            "jwtSecret": "s3cr3t",
            "vrmTokenId": "901",
            "vrmUserId": 22,
            "vrmUsername": "user@example.com"
        },
        "settings": {"vrm": {"enabledPortalIds": ["A"]}, "port": 3000},
        "users": [{"name": "admin"}]
    }))
    .await;

    h.vrm.deauthenticate().await.unwrap();

    let expected = json!({
        "secrets": {"adminUser": "admin", "jwtSecret": "s3cr3t"},
        "settings": {"vrm": {"enabledPortalIds": ["A"]}, "port": 3000},
        "users": [{"name": "admin"}]
    });
    assert_eq!(
        h.raw_document().unwrap(),
        serde_json::to_vec_pretty(&expected).unwrap()
    );
    assert!(h.vrm.credentials().await.unwrap().is_none());
    assert!(!h.vrm.store().cached().has_credential_fields());
}

#[tokio::test]
async fn test_deauthenticate_keeps_host_section_order() {
    let h = Harness::new().await;
    h.seed(json!({
        "users": [{"name": "admin", "type": "admin"}],
        "secrets": {
            "adminUser": "admin",
            "vrmToken": "access-xyz",
            "vrmTokenId": "901",
            "vrmUserId": "22",
            "vrmUsername": "user@example.com"
        }
    }))
    .await;

    h.vrm.deauthenticate().await.unwrap();

    let expected = json!({
        "users": [{"name": "admin", "type": "admin"}],
        "secrets": {"adminUser": "admin"}
    });
    assert_eq!(
        h.raw_document().unwrap(),
        serde_json::to_vec_pretty(&expected).unwrap()
    );
    let document = h.document();
    let keys: Vec<&String> = document.as_object().unwrap().keys().collect();
    assert_eq!(keys, vec!["users", "secrets"]);
}

#[tokio::test]
async fn test_deauthenticate_write_failure_changes_nothing() {
    let mut h = Harness::new().await;
    h.seed(logged_in_document()).await;
    let before = h.raw_document();

    // Prime the cache, then make the medium read-only
    h.vrm.store().read().await.unwrap();
    h.storage.set_read_only(true);

    let result = h.vrm.deauthenticate().await;

    assert!(matches!(result, Err(VrmError::Persistence(_))));
    assert_eq!(h.raw_document(), before);
    assert!(h.vrm.store().cached().credentials().is_some());
    assert!(!h.statuses().last().unwrap().is_success());
}

// ============================================================================
// Discover installations
// ============================================================================

#[tokio::test]
async fn test_discover_without_login_makes_no_network_call() {
    let mut h = Harness::new().await;

    let result = h.vrm.discover_installations().await;

    match result {
        Err(VrmError::Auth(message)) => assert_eq!(message, "Please log in"),
        other => panic!("expected auth error, got {:?}", other),
    }
    assert_eq!(h.request_count().await, 0);
    assert!(!h.statuses()[0].is_success());
}

#[tokio::test]
async fn test_discover_migrates_legacy_disabled_list_once() {
    let mut h = Harness::new().await;
    let mut document = logged_in_document();
    document["settings"] = json!({"vrm": {"disabled": ["A", "B"], "pollInterval": 60}});
    h.seed(document).await;

    mount_installations(&h.server, &["A", "B", "C"], 2).await;

    let first = h.vrm.discover_installations().await.unwrap();
    assert_eq!(first.len(), 3);

    let migrated = h.document();
    assert_eq!(
        migrated["settings"]["vrm"],
        json!({"pollInterval": 60, "enabledPortalIds": ["C"]})
    );
    assert_eq!(
        h.vrm.enabled_portal_ids().await.unwrap(),
        vec!["C".to_string()]
    );
    let after_first = h.raw_document();

    // Second discovery: nothing left to migrate, settings untouched
    h.vrm.discover_installations().await.unwrap();
    assert_eq!(h.raw_document(), after_first);

    assert_eq!(
        h.discovered(),
        vec![
            vec!["A".to_string(), "B".to_string(), "C".to_string()],
            vec!["A".to_string(), "B".to_string(), "C".to_string()],
        ]
    );
}

#[tokio::test]
async fn test_discover_without_legacy_field_does_not_write() {
    let mut h = Harness::new().await;
    h.seed(logged_in_document()).await;
    let before = h.raw_document();

    mount_installations(&h.server, &["A", "B"], 1).await;

    let installations = h.vrm.discover_installations().await.unwrap();

    assert_eq!(installations.len(), 2);
    assert_eq!(h.raw_document(), before);

    let messages: Vec<String> = h.statuses().into_iter().map(|s| s.message).collect();
    assert_eq!(messages, vec!["Getting installations", "Installations retrieved"]);
}

#[tokio::test]
async fn test_discover_portal_failure_mutates_nothing() {
    let mut h = Harness::new().await;
    let mut document = logged_in_document();
    document["settings"] = json!({"vrm": {"disabled": ["A"]}});
    h.seed(document).await;
    let before = h.raw_document();

    Mock::given(method("GET"))
        .and(path("/v2/users/22/installations"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "success": false,
            "errors": "Token is invalid"
        })))
        .mount(&h.server)
        .await;

    let result = h.vrm.discover_installations().await;

    assert!(matches!(result, Err(VrmError::Auth(_))));
    assert_eq!(h.raw_document(), before);
    assert_eq!(h.statuses().last().unwrap().message, "Token is invalid");
}

// ============================================================================
// Broker connection
// ============================================================================

#[tokio::test]
async fn test_broker_without_token_attempts_nothing() {
    let h = Harness::new().await;

    let result = h.vrm.open_broker_connection("mqtt.example.com", 8883).await;

    assert!(matches!(result, Err(VrmError::Auth(_))));
    assert_eq!(h.transport.attempts(), 0);
    assert_eq!(h.request_count().await, 0);
}

#[tokio::test]
async fn test_broker_token_failure_attempts_no_connection() {
    let mut h = Harness::new().await;
    h.seed(logged_in_document()).await;

    Mock::given(method("POST"))
        .and(path("/v2/auth/generatetoken"))
        .respond_with(
            ResponseTemplate::new(403).set_body_json(json!({"success": false, "errors": "Forbidden"})),
        )
        .expect(1)
        .mount(&h.server)
        .await;

    let result = h.vrm.open_broker_connection("mqtt.example.com", 8883).await;

    match result {
        Err(VrmError::Auth(message)) => {
            assert_eq!(message, "Broker token request failed: Forbidden")
        }
        other => panic!("expected auth error, got {:?}", other),
    }
    assert_eq!(h.transport.attempts(), 0);

    let statuses = h.statuses();
    assert_eq!(statuses.len(), 1);
    assert!(!statuses[0].is_success());
}

#[tokio::test]
async fn test_broker_token_unreachable_portal_names_the_exchange() {
    let mut h = Harness::new().await;
    h.seed(logged_in_document()).await;

    // Nothing listens on the discard port
    let vrm = Bootstrap::new(
        VrmClient::new("http://127.0.0.1:9"),
        DocumentStore::new(h.storage.clone()),
        h.transport.clone(),
    );
    let (tx, mut events) = unbounded_channel();
    let vrm = vrm.with_events(tx);

    let result = vrm.open_broker_connection("mqtt.example.com", 8883).await;

    match result {
        Err(VrmError::Network(err)) => {
            assert!(err.to_string().contains("Broker token request failed"))
        }
        other => panic!("expected network error, got {:?}", other),
    }
    assert_eq!(h.transport.attempts(), 0);

    match events.try_recv() {
        Ok(VrmEvent::Status(status)) => {
            assert!(!status.is_success());
            assert!(status.message.contains("Broker token request failed"));
        }
        other => panic!("expected failure status, got {:?}", other),
    }
    assert!(h.statuses().is_empty());
}

#[tokio::test]
async fn test_broker_success_resolves_with_connection_and_one_status() {
    let mut h = Harness::new().await;
    h.seed(logged_in_document()).await;

    Mock::given(method("POST"))
        .and(path("/v2/auth/generatetoken"))
        .and(header("X-Authorization", "Token access-xyz"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "mqtt-once"})))
        .expect(1)
        .mount(&h.server)
        .await;

    let connection = h
        .vrm
        .open_broker_connection("mqtt.example.com", 8883)
        .await
        .unwrap();

    assert_eq!(connection.address, "mqtt.example.com");
    assert_eq!(connection.port, 8883);
    assert_eq!(
        connection.credential.username(),
        "vrmlogin_live_user@example.com"
    );
    assert_eq!(connection.credential.password(), "mqtt-once");
    assert_eq!(h.transport.attempts(), 1);

    let statuses = h.statuses();
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].is_success());
    assert_eq!(statuses[0].message, "Connected");
}

#[tokio::test]
async fn test_broker_refusal_is_reported() {
    let mut h = Harness::with_transport(RecordingTransport::refusing()).await;
    h.seed(logged_in_document()).await;

    Mock::given(method("POST"))
        .and(path("/v2/auth/generatetoken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "mqtt-once"})))
        .mount(&h.server)
        .await;

    let result = h.vrm.open_broker_connection("mqtt.example.com", 8883).await;

    assert!(matches!(result, Err(VrmError::Auth(_))));
    assert_eq!(h.transport.attempts(), 1);

    let statuses = h.statuses();
    assert_eq!(statuses.len(), 1);
    assert!(!statuses[0].is_success());
}

#[tokio::test]
async fn test_broker_uses_configured_prefix() {
    let h = Harness::new().await;
    h.seed(logged_in_document()).await;

    Mock::given(method("POST"))
        .and(path("/v2/auth/generatetoken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "mqtt-once"})))
        .mount(&h.server)
        .await;

    let vrm = Bootstrap::new(
        VrmClient::new(h.server.uri()),
        DocumentStore::new(h.storage.clone()),
        h.transport.clone(),
    )
    .with_username_prefix("vrmlogin_test");

    let connection = vrm
        .open_broker_connection("mqtt.example.com", 8883)
        .await
        .unwrap();
    assert_eq!(
        connection.credential.username(),
        "vrmlogin_test_user@example.com"
    );
}
