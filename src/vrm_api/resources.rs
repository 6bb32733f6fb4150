use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Body of `PUT /v2/auth/login`
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Successful login: a short-lived session token and the account id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortalSession {
    #[serde(rename = "token")]
    pub session_token: String,
    #[serde(rename = "idUser", deserialize_with = "string_or_number")]
    pub account_id: String,
}

/// Body of `POST /v2/users/{idUser}/accesstokens/create`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAccessTokenRequest {
    pub name: String,
}

/// Newly created long-lived access token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessToken {
    #[serde(rename = "token")]
    pub access_token: String,
    #[serde(rename = "idAccessToken", deserialize_with = "string_or_number")]
    pub token_id: String,
}

/// Response of `GET /v2/users/{idUser}/installations`
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationsResponse {
    pub records: Vec<InstallationRecord>,
}

/// One installation as the portal reports it
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub identifier: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Response of `POST /v2/auth/generatetoken`
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerTokenResponse {
    pub token: String,
}

/// A registered installation discovered on the portal
///
/// Serializes as `{"portalId": ..., "name": ...}`, the shape hosts already
/// consume for their installation pickers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Installation {
    #[serde(rename = "portalId")]
    pub portal_id: String,
    #[serde(rename = "name")]
    pub display_name: String,
}

impl From<InstallationRecord> for Installation {
    fn from(record: InstallationRecord) -> Self {
        Self {
            portal_id: record.identifier,
            display_name: record.name.unwrap_or_default(),
        }
    }
}

/// String form of a portal identifier, which the portal sends as either a
/// JSON number or a string
pub fn portal_id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    portal_id_string(&value).ok_or_else(|| {
        serde::de::Error::custom(format!("expected string or number, found {}", value))
    })
}

/// Human-readable detail for a portal `errors` payload
///
/// The payload is a plain string for most endpoints, but token creation
/// reports per-field errors (`{"name": "..."}`). When `preferred_field` is
/// present it wins over the rest of the object.
pub fn error_detail(errors: &Value, preferred_field: Option<&str>) -> String {
    if let Some(field) = preferred_field {
        if let Some(detail) = errors.get(field).filter(|v| !v.is_null()) {
            return error_detail(detail, None);
        }
    }

    match errors {
        Value::Null => "Unknown error".to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| error_detail(item, None))
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(fields) => fields
            .iter()
            .map(|(key, value)| format!("{}: {}", key, error_detail(value, None)))
            .collect::<Vec<_>>()
            .join("; "),
        other => other.to_string(),
    }
}
