//! An identity provider that uses an OAuth2 token endpoint as an authority
//!
//! This performs the _client credentials_ flow, as used by service principals.

use std::{marker::PhantomData, time::Duration};

use async_trait::async_trait;
use credstream_clock::{Clock, System};
use thiserror::Error;

use super::IdentityProvider;
use crate::{tokens::TokenError, AccessTokenRef, Token};

pub mod dto;

/// An identity provider performing the client credentials flow
#[derive(Debug)]
pub struct ClientCredentialsProvider<C = System, T = FormBody> {
    client: reqwest::Client,
    token_url: reqwest::Url,
    credentials: dto::ClientCredentialsWithScopes,
    clock: C,
    content_type: PhantomData<fn() -> T>,
}

impl ClientCredentialsProvider<System, FormBody> {
    /// Constructs a new client credentials provider
    ///
    /// Credentials are sent to the authority as form data.
    pub fn new(
        client: reqwest::Client,
        token_url: reqwest::Url,
        credentials: dto::ClientCredentialsWithScopes,
    ) -> Self {
        Self {
            client,
            token_url,
            credentials,
            clock: System,
            content_type: PhantomData,
        }
    }
}

impl<C, T> ClientCredentialsProvider<C, T> {
    /// Configures the provider to send credentials to
    /// the authority as JSON
    pub fn using_json(self) -> ClientCredentialsProvider<C, JsonBody> {
        ClientCredentialsProvider {
            client: self.client,
            token_url: self.token_url,
            credentials: self.credentials,
            clock: self.clock,
            content_type: PhantomData,
        }
    }

    /// Sets a custom clock to be used when a token does not carry its issue time
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> ClientCredentialsProvider<D, T> {
        ClientCredentialsProvider {
            client: self.client,
            token_url: self.token_url,
            credentials: self.credentials,
            clock,
            content_type: PhantomData,
        }
    }
}

#[async_trait]
impl<C, T> IdentityProvider for ClientCredentialsProvider<C, T>
where
    C: Clock + Send + Sync + 'static,
    T: RequestType + 'static,
{
    type Error = TokenRequestError;

    async fn request_token(&self) -> Result<Token, Self::Error> {
        request_token::<_, T>(
            &self.client,
            self.token_url.clone(),
            &self.credentials,
            &self.clock,
        )
        .await
    }
}

/// An error while attempting to request a new token from the authority
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// An error from the authority with an error body
    #[error("error requesting token from authority: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    TokenBodyError(#[from] serde_json::Error),
    /// The authority returned a token with an unusable lifetime
    #[error("authority returned an unusable token")]
    InvalidToken(#[from] TokenError),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(reqwest::Error),
    /// Unable to send a token request to the authority
    #[error("error sending request to authority")]
    RequestSend(reqwest::Error),
}

#[tracing::instrument(
    err,
    skip(client, token_url, credentials, clock),
    fields(
        token_url = %token_url,
        credentials.client_id = %credentials.credentials().client_id,
        credentials.scope = %credentials.scope_param(),
    ),
)]
async fn request_token<C: Clock, T: RequestType>(
    client: &reqwest::Client,
    token_url: reqwest::Url,
    credentials: &dto::ClientCredentialsWithScopes,
    clock: &C,
) -> Result<Token, TokenRequestError> {
    tracing::trace!("requesting token from authority");

    let req = T::attach_payload(client.post(token_url), credentials);
    let resp = req.send().await.map_err(TokenRequestError::RequestSend)?;

    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received token response from issuing authority"
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

    let token = token_from_response(resp.access_token, resp.expires_in, clock)?;

    tracing::info!(
        is_jwt = !token.raw_claims().is_empty(),
        lifetime_ms = token.lifetime().as_millis() as u64,
        expiry = token.expires_at().0,
        "received new token"
    );

    Ok(token)
}

/// Builds a token from its JWT claims, falling back to `expires_in` for opaque tokens
pub(super) fn token_from_response<C: Clock>(
    access_token: &AccessTokenRef,
    expires_in: u64,
    clock: &C,
) -> Result<Token, TokenError> {
    let access_token = access_token.to_owned();
    match Token::from_jwt_with_clock(access_token.clone(), clock) {
        Ok(token) => Ok(token),
        Err(error) => {
            tracing::debug!(
                error = (&error as &dyn std::error::Error),
                "access token is not a usable JWT, using `expires_in` for its lifetime"
            );
            Token::with_lifetime_and_clock(access_token, Duration::from_secs(expires_in), clock)
        }
    }
}

/// A manner of attaching a serializable payload to a request
pub trait RequestType: Send + Sync {
    /// Attaches the serializable payload to the request body
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder;
}

/// Attaches credentials to the request body as JSON
#[derive(Debug)]
pub struct JsonBody;

/// Attaches credentials to the request body as URL-encoded form data
#[derive(Debug)]
pub struct FormBody;

impl RequestType for JsonBody {
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.json(payload)
    }
}

impl RequestType for FormBody {
    fn attach_payload<S: serde::Serialize>(
        request: reqwest::RequestBuilder,
        payload: &S,
    ) -> reqwest::RequestBuilder {
        request.form(payload)
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use credstream_clock::{TestClock, UnixTime};
    use serde_json::json;

    use super::*;
    use crate::tokens::test_util::unsigned_jwt;

    #[test]
    fn jwt_access_tokens_use_their_claims() -> Result<()> {
        let jwt = unsigned_jwt(&json!({ "oid": "principal", "iat": 100, "exp": 400 }));
        let body = json!({ "access_token": jwt, "expires_in": 9999 }).to_string();
        let resp: dto::TokenResponse = serde_json::from_str(&body)?;

        let clock = TestClock::new(UnixTime::from_secs(150));
        let token = token_from_response(resp.access_token, resp.expires_in, &clock)?;
        assert_eq!(token.issued_at(), UnixTime::from_secs(100));
        assert_eq!(token.expires_at(), UnixTime::from_secs(400));
        assert_eq!(token.principal(), Some("principal"));
        Ok(())
    }

    #[test]
    fn opaque_access_tokens_use_expires_in() -> Result<()> {
        let body = r#"{"access_token":"opaque","expires_in":60}"#;
        let resp: dto::TokenResponse = serde_json::from_str(body)?;

        let clock = TestClock::new(UnixTime::from_secs(10));
        let token = token_from_response(resp.access_token, resp.expires_in, &clock)?;
        assert_eq!(token.issued_at(), UnixTime::from_secs(10));
        assert_eq!(token.expires_at(), UnixTime::from_secs(70));
        assert!(token.raw_claims().is_empty());
        Ok(())
    }
}
