//! DTOs for interacting with OAuth2 token endpoints

use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};

use crate::{AccessTokenRef, ClientId, ClientSecret, Scope};

/// The scope requested when none are configured
pub const DEFAULT_SCOPE: &str = "https://redis.azure.com/.default";

/// Client credentials
#[derive(Debug, Serialize)]
pub struct ClientCredentials {
    /// The client ID
    pub client_id: ClientId,

    /// The client secret
    pub client_secret: ClientSecret,
}

/// Client credentials with the scopes to request
#[derive(Debug)]
pub struct ClientCredentialsWithScopes {
    credentials: Arc<ClientCredentials>,
    scopes: Vec<Scope>,
}

impl ClientCredentialsWithScopes {
    /// Pairs client credentials with the scopes to request
    ///
    /// If `scopes` is empty, [`DEFAULT_SCOPE`] is requested.
    pub fn new(credentials: impl Into<Arc<ClientCredentials>>, mut scopes: Vec<Scope>) -> Self {
        if scopes.is_empty() {
            scopes.push(Scope::from_static(DEFAULT_SCOPE));
        }

        Self {
            credentials: credentials.into(),
            scopes,
        }
    }

    /// The client credentials
    pub fn credentials(&self) -> &ClientCredentials {
        &self.credentials
    }

    /// The scopes that will be requested
    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    pub(super) fn scope_param(&self) -> String {
        self.scopes
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Serialize for ClientCredentialsWithScopes {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut ser = serializer.serialize_struct("ClientCredentialsWithScopes", 4)?;
        ser.serialize_field("grant_type", "client_credentials")?;
        ser.serialize_field("client_id", &self.credentials.client_id)?;
        ser.serialize_field("client_secret", &self.credentials.client_secret)?;
        ser.serialize_field("scope", &self.scope_param())?;
        ser.end()
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub(super) struct TokenResponse<'a> {
    #[serde(borrow)]
    pub access_token: &'a AccessTokenRef,
    #[serde(borrow, default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<&'a str>,
    pub expires_in: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> ClientCredentials {
        ClientCredentials {
            client_id: ClientId::from_static("client"),
            client_secret: ClientSecret::from_static("shh"),
        }
    }

    #[test]
    fn falls_back_to_the_default_scope() {
        let creds = ClientCredentialsWithScopes::new(credentials(), Vec::new());
        assert_eq!(creds.scope_param(), DEFAULT_SCOPE);
    }

    #[test]
    fn serializes_grant_and_space_separated_scopes() {
        let creds = ClientCredentialsWithScopes::new(
            credentials(),
            vec![Scope::from_static("a/.default"), Scope::from_static("b")],
        );

        let json = serde_json::to_value(&creds).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "grant_type": "client_credentials",
                "client_id": "client",
                "client_secret": "shh",
                "scope": "a/.default b",
            })
        );
    }

    #[test]
    fn parses_token_response() {
        let body = r#"{"token_type":"Bearer","expires_in":3599,"ext_expires_in":3599,"access_token":"abc"}"#;
        let resp: TokenResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.access_token.as_str(), "abc");
        assert_eq!(resp.expires_in, 3599);
        assert_eq!(resp.token_type, Some("Bearer"));
    }
}
