use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::vrm_api::resources::{
    error_detail, AccessToken, BrokerTokenResponse, CreateAccessTokenRequest, Installation,
    InstallationsResponse, LoginRequest, PortalSession,
};
use crate::vrm_api::types::{ApiError, VrmError};

/// Production VRM API endpoint
pub const DEFAULT_API_URL: &str = "https://vrmapi.victronenergy.com";

/// Header the VRM API reads credentials from
const AUTH_HEADER: &str = "X-Authorization";

/// HTTP client for the VRM portal API
///
/// Each method is a single round trip and never touches local state; the
/// [`Bootstrap`](crate::Bootstrap) orchestrator decides what to persist.
#[derive(Debug, Clone)]
pub struct VrmClient {
    /// Base URL of the VRM API, without trailing slash
    base_url: String,
    /// HTTP client for making requests
    client: reqwest::Client,
}

impl Default for VrmClient {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL)
    }
}

impl VrmClient {
    /// Create a new VRM API client
    ///
    /// # Example
    ///
    /// ```no_run
    /// use vrm_sdk::VrmClient;
    ///
    /// let client = VrmClient::new("https://vrmapi.victronenergy.com");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_http_client(base_url, reqwest::Client::new())
    }

    /// Create a client that reuses an existing `reqwest::Client`
    pub fn with_http_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        tracing::debug!("Creating VrmClient with base URL: {}", base_url);

        Self { base_url, client }
    }

    /// Get the base URL for this client
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Log in with portal credentials
    ///
    /// Returns a short-lived session token plus the account id. Fails with
    /// [`VrmError::Auth`] carrying the portal's message when the credentials
    /// are rejected.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use vrm_sdk::VrmClient;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let client = VrmClient::default();
    /// let session = client.login("user@example.com", "hunter2").await?;
    /// println!("Logged in as account {}", session.account_id);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn login(&self, username: &str, password: &str) -> Result<PortalSession, VrmError> {
        let url = format!("{}/v2/auth/login", self.base_url);
        tracing::info!("Logging in to VRM as {}", username);
        tracing::debug!("Sending login request to: {}", url);

        let payload = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };

        let response = self
            .client
            .put(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to send login request: {}", e);
                ApiError::from(e)
            })?;

        let session: PortalSession = decode(response, "login", None).await?;
        require_field("login", "token", &session.session_token)?;
        require_field("login", "idUser", &session.account_id)?;
        tracing::info!("VRM login succeeded for account {}", session.account_id);
        Ok(session)
    }

    /// Create a named long-lived access token for the account
    ///
    /// The session token from [`login`](Self::login) authorizes the call.
    /// Name conflicts are reported by the portal as a per-field error, and
    /// that field's message is what ends up in [`VrmError::Auth`].
    pub async fn create_access_token(
        &self,
        session_token: &str,
        account_id: &str,
        token_name: &str,
    ) -> Result<AccessToken, VrmError> {
        let url = format!(
            "{}/v2/users/{}/accesstokens/create",
            self.base_url, account_id
        );
        tracing::debug!("Creating access token '{}' at: {}", token_name, url);

        let payload = CreateAccessTokenRequest {
            name: token_name.to_string(),
        };

        let response = self
            .client
            .post(&url)
            .header(AUTH_HEADER, format!("Bearer {}", session_token))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to send access token request: {}", e);
                ApiError::from(e)
            })?;

        let token: AccessToken = decode(response, "access token creation", Some("name")).await?;
        require_field("access token creation", "token", &token.access_token)?;
        require_field("access token creation", "idAccessToken", &token.token_id)?;
        tracing::info!(
            "Access token created: token_id={}, length={}",
            token.token_id,
            token.access_token.len()
        );
        Ok(token)
    }

    /// List the installations the account can see
    ///
    /// Portal identifiers are normalized to strings.
    pub async fn list_installations(
        &self,
        access_token: &str,
        account_id: &str,
    ) -> Result<Vec<Installation>, VrmError> {
        let url = format!("{}/v2/users/{}/installations", self.base_url, account_id);
        tracing::debug!("Listing installations from: {}", url);

        let response = self
            .client
            .get(&url)
            .header(AUTH_HEADER, format!("Token {}", access_token))
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to send installations request: {}", e);
                ApiError::from(e)
            })?;

        let listing: InstallationsResponse = decode(response, "installation listing", None).await?;
        let installations: Vec<Installation> = listing
            .records
            .into_iter()
            .map(Installation::from)
            .collect();

        tracing::debug!("Portal returned {} installations", installations.len());
        Ok(installations)
    }

    /// Exchange the access token for a single-use broker password
    pub async fn mint_broker_token(&self, access_token: &str) -> Result<String, VrmError> {
        let url = format!("{}/v2/auth/generatetoken", self.base_url);
        tracing::debug!("Requesting broker token from: {}", url);

        let response = self
            .client
            .post(&url)
            .header(AUTH_HEADER, format!("Token {}", access_token))
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to send broker token request: {}", e);
                ApiError::from(e)
            })?;

        let minted: BrokerTokenResponse = decode(response, "broker token request", None).await?;
        require_field("broker token request", "token", &minted.token)?;
        tracing::debug!("Broker token length: {}", minted.token.len());
        Ok(minted.token)
    }
}

/// Reject an empty identifier or token in an otherwise well-formed response
fn require_field(operation: &str, field: &str, value: &str) -> Result<(), VrmError> {
    if value.trim().is_empty() {
        tracing::error!("{} response has an empty '{}' field", operation, field);
        return Err(ApiError::Parse(format!("Response field '{}' is empty", field)).into());
    }
    Ok(())
}

/// Decode a portal response into `T`
///
/// - `{"success": false, "errors": ...}` becomes [`VrmError::Auth`]
/// - a body that is missing the documented fields but carries `errors`
///   is also reported as [`VrmError::Auth`]
/// - anything else that does not decode is a [`VrmError::Network`]
async fn decode<T: DeserializeOwned>(
    response: reqwest::Response,
    operation: &str,
    preferred_field: Option<&str>,
) -> Result<T, VrmError> {
    let status = response.status();
    tracing::debug!("Received {} response with status: {}", operation, status);

    let body = response.text().await.map_err(|e| {
        tracing::error!("Failed to read {} response body: {}", operation, e);
        ApiError::from(e)
    })?;

    let value: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) if status.is_success() => {
            tracing::error!("Failed to parse {} response: {}", operation, e);
            return Err(ApiError::Parse(format!("Failed to parse response JSON: {}", e)).into());
        }
        Err(_) => {
            tracing::error!("{} failed: HTTP {} - {}", operation, status.as_u16(), body);
            return Err(ApiError::Http {
                status: status.as_u16(),
                message: body,
            }
            .into());
        }
    };

    let errors = value.get("errors").filter(|e| !e.is_null()).cloned();

    if value.get("success") == Some(&Value::Bool(false)) {
        let detail = error_detail(errors.as_ref().unwrap_or(&Value::Null), preferred_field);
        tracing::error!("{} rejected by portal: {}", operation, detail);
        return Err(VrmError::Auth(detail));
    }

    if !status.is_success() {
        if let Some(errors) = &errors {
            let detail = error_detail(errors, preferred_field);
            tracing::error!("{} rejected by portal: {}", operation, detail);
            return Err(VrmError::Auth(detail));
        }
        tracing::error!("{} failed: HTTP {} - {}", operation, status.as_u16(), body);
        return Err(ApiError::Http {
            status: status.as_u16(),
            message: body,
        }
        .into());
    }

    serde_json::from_value::<T>(value).map_err(|e| {
        if let Some(errors) = &errors {
            let detail = error_detail(errors, preferred_field);
            tracing::error!("{} returned errors: {}", operation, detail);
            VrmError::Auth(detail)
        } else {
            tracing::error!("Unexpected {} response shape: {}", operation, e);
            ApiError::Parse(format!("Unexpected response shape: {}", e)).into()
        }
    })
}
