//! Identity providers
//!
//! An identity provider performs the actual exchange with an authority and
//! hands back a [`Token`]. The token manager only ever talks to providers
//! through [`IdentityProvider`]; synchronous implementations can be adapted
//! with [`Blocking`].
//!
//! With the `oauth2` feature, [`oauth2`] requests tokens for a service
//! principal and [`managed_identity`] requests them for an Azure managed
//! identity.

use std::{convert::Infallible, error, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{error::CredentialsError, tokens::USERNAME_CLAIMS, Credentials, Token, Username};

#[cfg(feature = "oauth2")]
pub mod managed_identity;
#[cfg(feature = "oauth2")]
pub mod oauth2;

/// An asynchronous source for tokens
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// The error type returned in the event that retrieving a token fails
    type Error: error::Error + Send + Sync + 'static;

    /// Requests a token from the identity provider
    async fn request_token(&self) -> Result<Token, Self::Error>;

    /// Derives the credential pair presented to the host client from a token
    ///
    /// By default the principal claim (`oid`, then `sub`) is used as the username
    /// and the token value as the secret.
    fn credentials_for(&self, token: &Token) -> Result<Credentials, CredentialsError> {
        principal_credentials(token)
    }
}

/// A synchronous source for tokens
///
/// Wrap implementations in [`Blocking`] to hand them to a token manager.
pub trait BlockingIdentityProvider: Send + Sync + 'static {
    /// The error type returned in the event that retrieving a token fails
    type Error: error::Error + Send + Sync + 'static;

    /// Requests a token from the identity provider, blocking the calling thread
    fn request_token(&self) -> Result<Token, Self::Error>;

    /// Derives the credential pair presented to the host client from a token
    fn credentials_for(&self, token: &Token) -> Result<Credentials, CredentialsError> {
        principal_credentials(token)
    }
}

/// Uses the token's principal claim as the username and its value as the secret
pub fn principal_credentials(token: &Token) -> Result<Credentials, CredentialsError> {
    let username = token
        .principal()
        .ok_or(CredentialsError::MissingUsername {
            tried: USERNAME_CLAIMS,
        })?;

    Ok((Username::from(username), token.value().to_owned()))
}

/// Adapts a [`BlockingIdentityProvider`] by running each request on the
/// runtime's blocking thread pool
#[derive(Debug)]
pub struct Blocking<P> {
    inner: Arc<P>,
}

impl<P> Blocking<P> {
    /// Wraps a blocking identity provider
    pub fn new(inner: P) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

/// An error from a blocking identity provider
#[derive(Debug, Error)]
pub enum BlockingRequestError<E: error::Error + 'static> {
    /// The provider reported an error
    #[error(transparent)]
    Provider(E),
    /// The blocking task panicked or was cancelled
    #[error("blocking identity provider task failed")]
    Join(#[source] tokio::task::JoinError),
}

#[async_trait]
impl<P: BlockingIdentityProvider> IdentityProvider for Blocking<P> {
    type Error = BlockingRequestError<P::Error>;

    async fn request_token(&self) -> Result<Token, Self::Error> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.request_token())
            .await
            .map_err(BlockingRequestError::Join)?
            .map_err(BlockingRequestError::Provider)
    }

    fn credentials_for(&self, token: &Token) -> Result<Credentials, CredentialsError> {
        self.inner.credentials_for(token)
    }
}

/// An identity provider that always hands back the same token
///
/// Useful for fixed credentials, and for exercising a credentials provider
/// against an authority that caches the tokens it issues.
#[derive(Clone, Debug)]
pub struct StaticIdentityProvider {
    token: Token,
}

impl StaticIdentityProvider {
    /// Constructs a new provider for the given token
    pub fn new(token: Token) -> Self {
        Self { token }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    type Error = Infallible;

    async fn request_token(&self) -> Result<Token, Self::Error> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use color_eyre::Result;
    use serde_json::json;

    use super::*;

    struct Sequential;

    impl BlockingIdentityProvider for Sequential {
        type Error = std::io::Error;

        fn request_token(&self) -> Result<Token, Self::Error> {
            std::thread::sleep(Duration::from_millis(5));
            let claims = json!({ "oid": "blocking-user" });
            Token::with_lifetime("blocking", Duration::from_secs(60))
                .map(|t| t.with_claims(claims.as_object().cloned().unwrap_or_default()))
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_providers_run_off_the_async_threads() -> Result<()> {
        let provider = Blocking::new(Sequential);
        let token = provider.request_token().await?;
        let (username, secret) = provider.credentials_for(&token)?;

        assert_eq!(username.as_str(), "blocking-user");
        assert_eq!(secret.as_str(), "blocking");
        Ok(())
    }

    #[test]
    fn tokens_without_principal_have_no_credentials() -> Result<()> {
        let token = Token::with_lifetime("opaque", Duration::from_secs(1))?;
        let err = principal_credentials(&token).unwrap_err();
        assert!(matches!(err, CredentialsError::MissingUsername { .. }));
        Ok(())
    }
}
