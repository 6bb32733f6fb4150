//! MQTT broker connection for the VRM message broker.
//!
//! The broker accepts a single-use password minted from the account's access
//! token. Because that password cannot be reused, connections opened here
//! never reconnect on their own: once the event loop reports an error the
//! connection is finished and the caller has to mint a new credential through
//! [`Bootstrap::open_broker_connection`](crate::Bootstrap::open_broker_connection).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet,
    TlsConfiguration, Transport,
};

use crate::vrm_api::types::{ApiError, VrmError};

/// Prefix of broker usernames for the production portal
pub const DEFAULT_BROKER_USERNAME_PREFIX: &str = "vrmlogin_live";

/// Short-lived credential for one broker session
///
/// Never persisted. `Debug` output redacts the password.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerSessionCredential {
    username: String,
    password: String,
}

impl BrokerSessionCredential {
    /// Build the broker credential for a portal user
    ///
    /// The broker username is `<prefix>_<portal username>`; the password is
    /// the minted token.
    pub fn new(prefix: &str, portal_username: &str, token: impl Into<String>) -> Self {
        Self {
            username: format!("{}_{}", prefix, portal_username),
            password: token.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for BrokerSessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSessionCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Future returned by [`BrokerTransport::connect`]
pub type ConnectFuture<'a, C> = Pin<Box<dyn Future<Output = Result<C, VrmError>> + Send + 'a>>;

/// Opens broker sessions
///
/// `connect` resolves once the broker has accepted the session, or fails
/// without retrying.
pub trait BrokerTransport: Send + Sync {
    type Connection: Send;

    fn connect<'a>(
        &'a self,
        address: &'a str,
        port: u16,
        credential: BrokerSessionCredential,
    ) -> ConnectFuture<'a, Self::Connection>;
}

/// MQTT over TLS using `rumqttc`
///
/// The broker is a fixed portal host, so certificate chains are not
/// verified.
#[derive(Debug, Clone)]
pub struct MqttTransport {
    keep_alive: Duration,
    channel_capacity: usize,
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(60),
            channel_capacity: 64,
        }
    }
}

impl MqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// MQTT keep-alive interval
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Capacity of the request channel between client handle and event loop
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    fn options(&self, address: &str, port: u16, credential: BrokerSessionCredential) -> MqttOptions {
        let client_id = format!("vrm-sdk-{}", uuid::Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, address, port);
        options.set_keep_alive(self.keep_alive);
        options.set_credentials(credential.username, credential.password);
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
            Arc::new(insecure_tls_config()),
        )));
        options
    }
}

impl BrokerTransport for MqttTransport {
    type Connection = BrokerConnection;

    fn connect<'a>(
        &'a self,
        address: &'a str,
        port: u16,
        credential: BrokerSessionCredential,
    ) -> ConnectFuture<'a, BrokerConnection> {
        Box::pin(async move {
            tracing::info!(
                "Connecting to broker mqtts://{}:{} as {}",
                address,
                port,
                credential.username()
            );

            let options = self.options(address, port, credential);
            let (client, mut eventloop) = AsyncClient::new(options, self.channel_capacity);

            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        tracing::debug!("Broker accepted session: {:?}", ack.code);
                        break;
                    }
                    Ok(event) => tracing::trace!("Broker event before CONNACK: {:?}", event),
                    Err(e) => return Err(connection_error(e)),
                }
            }

            Ok(BrokerConnection {
                client,
                eventloop,
                closed: false,
            })
        })
    }
}

fn connection_error(err: ConnectionError) -> VrmError {
    tracing::error!("Broker connection failed: {}", err);
    match err {
        ConnectionError::ConnectionRefused(code) => {
            VrmError::Auth(format!("Broker refused connection: {:?}", code))
        }
        other => VrmError::Network(ApiError::Network(format!(
            "Broker connection failed: {}",
            other
        ))),
    }
}

/// Live broker session
///
/// Drive it with [`next_event`](Self::next_event); publish and subscribe
/// through [`client`](Self::client). The first error closes the session for
/// good.
pub struct BrokerConnection {
    client: AsyncClient,
    eventloop: EventLoop,
    closed: bool,
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl BrokerConnection {
    /// Handle for publishing and subscribing
    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next event from the broker
    ///
    /// After the first error every call fails immediately; polling a failed
    /// `rumqttc` event loop would reconnect with a spent password.
    pub async fn next_event(&mut self) -> Result<Event, VrmError> {
        if self.closed {
            return Err(VrmError::Network(ApiError::Network(
                "Broker connection closed".to_string(),
            )));
        }

        match self.eventloop.poll().await {
            Ok(event) => Ok(event),
            Err(e) => {
                self.closed = true;
                Err(connection_error(e))
            }
        }
    }

    /// Send DISCONNECT and stop
    pub async fn disconnect(mut self) -> Result<(), VrmError> {
        if self.closed {
            return Ok(());
        }
        self.client.disconnect().await.map_err(|e| {
            VrmError::Network(ApiError::Network(format!("Failed to disconnect: {}", e)))
        })?;
        // Flush the DISCONNECT before dropping the event loop
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        self.closed = true;
        Ok(())
    }

    /// Split into the raw `rumqttc` parts
    ///
    /// The caller takes over the event loop, including the responsibility of
    /// not polling it after an error.
    pub fn into_parts(self) -> (AsyncClient, EventLoop) {
        (self.client, self.eventloop)
    }
}

/// TLS client config that accepts any server certificate
fn insecure_tls_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
        .with_no_client_auth()
}

#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_username_uses_prefix() {
        let credential =
            BrokerSessionCredential::new(DEFAULT_BROKER_USERNAME_PREFIX, "user@example.com", "t0k");
        assert_eq!(credential.username(), "vrmlogin_live_user@example.com");
        assert_eq!(credential.password(), "t0k");
    }

    #[test]
    fn test_credential_debug_redacts_password() {
        let credential = BrokerSessionCredential::new("p", "u", "super-secret");
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_insecure_tls_config_builds() {
        let config = insecure_tls_config();
        assert!(config.alpn_protocols.is_empty());
    }

    #[tokio::test]
    async fn test_mqtt_connect_to_closed_port_fails_once() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = MqttTransport::new();
        let credential = BrokerSessionCredential::new("p", "u", "t");
        let result = transport.connect("127.0.0.1", port, credential).await;

        assert!(matches!(result, Err(VrmError::Network(_))));
    }
}
