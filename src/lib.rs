//! VRM SDK
//!
//! A Rust library for integrating a local application with the VRM portal.
//!
//! This SDK provides:
//! - Login and named access-token creation, persisted as one credential record
//! - Installation discovery, including migration of the legacy disabled list
//! - MQTT-over-TLS broker sessions authenticated with single-use tokens
//! - Pluggable storage for the credential document (plain, encrypted, in-memory)
//! - Status events for the host's notification surface
//!
//! # Example
//!
//! ```no_run
//! use vrm_sdk::{
//!     Bootstrap, DocumentStore, VrmConfig, VrmEvent,
//!     storage::FilesystemStorage,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = VrmConfig::from_env();
//! let storage = FilesystemStorage::new(&config.store_dir)?;
//! let store = DocumentStore::with_path(storage, config.document_path.clone());
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<VrmEvent>();
//! let vrm = Bootstrap::from_config(&config, store).with_events(tx);
//!
//! // Log in and store a named access token; installations are discovered next
//! vrm.authenticate("user@example.com", "password", "my-gateway").await?;
//!
//! // Open a broker session with a freshly minted credential
//! let mut connection = vrm.open_broker_connection("mqtt.victronenergy.com", 8883).await?;
//! let event = connection.next_event().await?;
//! println!("first broker event: {:?}", event);
//!
//! while let Ok(event) = rx.try_recv() {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod storage;
pub mod vrm_api;

// Re-export commonly used types
pub use config::VrmConfig;
pub use vrm_api::{
    bootstrap::Bootstrap,
    broker::{BrokerConnection, BrokerSessionCredential, BrokerTransport, MqttTransport},
    client::VrmClient,
    credentials::{CredentialRecord, CredentialStore, DocumentStore, StoreSnapshot},
    events::{EventSink, NullSink, StatusEvent, StatusOutcome, VrmEvent},
    resources::{
        AccessToken, BrokerTokenResponse, CreateAccessTokenRequest, Installation,
        InstallationRecord, InstallationsResponse, LoginRequest, PortalSession,
    },
    types::{ApiError, VrmError},
};
