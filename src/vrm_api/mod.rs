/// VRM portal integration module
///
/// This module connects a local application to the VRM portal: it turns a
/// user's login into a stored access token, discovers the user's
/// installations and opens sessions on the portal's MQTT broker.
///
/// ## Authentication Flow
///
/// 1. Host calls [`Bootstrap::authenticate`] with username, password and a token name
/// 2. The portal login returns a short-lived session token and account id
/// 3. The session token creates a named, long-lived access token
/// 4. The access token, its id, the account id and the username are stored in one write
/// 5. Installations are discovered with the new access token
///
/// ## Broker Flow
///
/// 1. The stored access token is exchanged for a single-use broker password
/// 2. An MQTT-over-TLS session is opened with `<prefix>_<username>` and that password
pub mod bootstrap;
pub mod broker;
pub mod client;
pub mod credentials;
pub mod events;
pub mod resources;
pub mod types;

pub use bootstrap::Bootstrap;
pub use broker::{BrokerConnection, BrokerSessionCredential, BrokerTransport, MqttTransport};
pub use client::VrmClient;
pub use credentials::{CredentialRecord, CredentialStore, DocumentStore, StoreSnapshot};
pub use events::{EventSink, StatusEvent, StatusOutcome, VrmEvent};
pub use resources::Installation;
pub use types::{ApiError, VrmError};
