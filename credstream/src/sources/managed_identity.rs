//! An identity provider for Azure managed identities
//!
//! Tokens are requested from the instance metadata service reachable from
//! workloads hosted in Azure. No secret is involved: the service vouches for
//! the identity assigned to the host.

use async_trait::async_trait;
use credstream_clock::{Clock, System};

use super::{
    oauth2::{token_from_response, TokenRequestError},
    IdentityProvider,
};
use crate::{ClientId, ObjectId, Resource, ResourceId, ResourceRef, Token};

pub mod dto;

/// The managed identity that tokens are requested for
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManagedIdentity {
    /// The identity assigned to the hosting resource itself
    SystemAssigned,
    /// A user-assigned identity attached to the hosting resource
    UserAssigned(UserAssignedId),
}

impl ManagedIdentity {
    fn kind(&self) -> &'static str {
        match self {
            Self::SystemAssigned => "system-assigned",
            Self::UserAssigned(UserAssignedId::ClientId(_)) => "user-assigned (client_id)",
            Self::UserAssigned(UserAssignedId::ObjectId(_)) => "user-assigned (object_id)",
            Self::UserAssigned(UserAssignedId::ResourceId(_)) => "user-assigned (msi_res_id)",
        }
    }
}

/// Selects one of several user-assigned identities
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserAssignedId {
    /// By the identity's client ID
    ClientId(ClientId),
    /// By the identity's object ID
    ObjectId(ObjectId),
    /// By the identity's Azure resource ID
    ResourceId(ResourceId),
}

/// An identity provider backed by the instance metadata service
///
/// The service caches tokens on its side, so every request made here is a
/// fresh request to the service.
#[derive(Debug)]
pub struct ManagedIdentityProvider<C = System> {
    client: reqwest::Client,
    endpoint: String,
    resource: Resource,
    identity: ManagedIdentity,
    clock: C,
}

impl ManagedIdentityProvider<System> {
    /// Constructs a provider requesting tokens for `resource` on behalf of `identity`
    pub fn new(client: reqwest::Client, identity: ManagedIdentity, resource: Resource) -> Self {
        Self {
            client,
            endpoint: dto::DEFAULT_ENDPOINT.to_owned(),
            resource,
            identity,
            clock: System,
        }
    }
}

impl<C> ManagedIdentityProvider<C> {
    /// Overrides the token endpoint, which defaults to [`dto::DEFAULT_ENDPOINT`]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Sets a custom clock to be used when a token does not carry its issue time
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> ManagedIdentityProvider<D> {
        ManagedIdentityProvider {
            client: self.client,
            endpoint: self.endpoint,
            resource: self.resource,
            identity: self.identity,
            clock,
        }
    }

    /// The identity tokens are requested for
    pub fn identity(&self) -> &ManagedIdentity {
        &self.identity
    }

    /// The resource tokens are requested for
    pub fn resource(&self) -> &ResourceRef {
        &self.resource
    }
}

#[async_trait]
impl<C> IdentityProvider for ManagedIdentityProvider<C>
where
    C: Clock + Send + Sync + 'static,
{
    type Error = TokenRequestError;

    async fn request_token(&self) -> Result<Token, Self::Error> {
        let query = dto::TokenQuery::new(&self.resource, &self.identity);
        request_token(
            &self.client,
            &self.endpoint,
            &query,
            self.identity.kind(),
            &self.clock,
        )
        .await
    }
}

#[tracing::instrument(
    err,
    skip(client, query, clock),
    fields(resource = %query.resource),
)]
async fn request_token<C: Clock>(
    client: &reqwest::Client,
    endpoint: &str,
    query: &dto::TokenQuery<'_>,
    identity: &'static str,
    clock: &C,
) -> Result<Token, TokenRequestError> {
    tracing::trace!("requesting token from instance metadata service");

    let resp = client
        .get(endpoint)
        .header("Metadata", "true")
        .query(query)
        .send()
        .await
        .map_err(TokenRequestError::RequestSend)?;

    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received token response from instance metadata service"
    );

    if let Err(error) = resp.error_for_status_ref() {
        let body = resp
            .text()
            .await
            .map_err(TokenRequestError::BodyReadError)?;
        return Err(TokenRequestError::ErrorWithBody {
            source: error,
            body,
        });
    }

    let body = resp
        .bytes()
        .await
        .map_err(TokenRequestError::BodyReadError)?;
    let resp: dto::TokenResponse = serde_json::from_slice(&body)?;

    if let Some(token_type) = resp.token_type {
        tracing::trace!(token_type, "token type reported by service");
    }

    let token = token_from_response(resp.access_token, resp.expires_in, clock)?;

    tracing::info!(
        is_jwt = !token.raw_claims().is_empty(),
        lifetime_ms = token.lifetime().as_millis() as u64,
        expiry = token.expires_at().0,
        "received new managed identity token"
    );

    Ok(token)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use color_eyre::Result;
    use credstream_clock::{TestClock, UnixTime};
    use serde_json::json;

    use super::*;
    use crate::tokens::test_util::unsigned_jwt;

    #[test]
    fn builds_provider_for_the_default_endpoint() {
        let provider = ManagedIdentityProvider::new(
            reqwest::Client::new(),
            ManagedIdentity::SystemAssigned,
            Resource::from_static("https://redis.azure.com"),
        );
        assert_eq!(provider.endpoint, dto::DEFAULT_ENDPOINT);
        assert_eq!(provider.resource().as_str(), "https://redis.azure.com");

        let provider = provider.with_endpoint("http://localhost:50342/oauth2/token");
        assert_eq!(provider.endpoint, "http://localhost:50342/oauth2/token");
        assert_eq!(provider.identity(), &ManagedIdentity::SystemAssigned);
    }

    #[test]
    fn opaque_service_tokens_use_the_reported_lifetime() -> Result<()> {
        let body = r#"{"access_token":"opaque","expires_in":"3599","token_type":"Bearer"}"#;
        let resp: dto::TokenResponse = serde_json::from_str(body)?;

        let clock = TestClock::new(UnixTime::from_secs(1_000));
        let token = token_from_response(resp.access_token, resp.expires_in, &clock)?;
        assert_eq!(token.issued_at(), UnixTime::from_secs(1_000));
        assert_eq!(token.lifetime(), Duration::from_secs(3599));
        Ok(())
    }

    #[test]
    fn service_jwts_carry_the_identity_as_principal() -> Result<()> {
        let jwt = unsigned_jwt(&json!({
            "oid": "managed-identity-object",
            "iat": 1_700_000,
            "exp": 1_703_600,
        }));
        let body = json!({ "access_token": jwt, "expires_in": "86399" }).to_string();
        let resp: dto::TokenResponse = serde_json::from_str(&body)?;

        let clock = TestClock::new(UnixTime::from_secs(0));
        let token = token_from_response(resp.access_token, resp.expires_in, &clock)?;
        assert_eq!(token.principal(), Some("managed-identity-object"));
        assert_eq!(token.lifetime(), Duration::from_secs(3600));
        Ok(())
    }
}
