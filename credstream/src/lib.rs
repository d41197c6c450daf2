//! Background acquisition and renewal of short-lived credentials
//!
//! Clients that authenticate with a `(username, secret)` pair derived from a
//! short-lived token should not have to think about when that token expires.
//! This crate keeps a token fresh in the background and hands out credentials
//! derived from it, so that only the very first request for credentials ever
//! waits on the identity provider.
//!
//! The pieces, from the bottom up:
//!
//! * A [`Token`] is an opaque access token with a known validity window.
//! * An [`IdentityProvider`] performs the actual exchange with an authority.
//!   Synchronous providers implement [`BlockingIdentityProvider`] and are
//!   adapted with [`Blocking`].
//! * The [`policy`] module decides when a token is due for refresh and how
//!   failed requests are retried.
//! * The [`EventBus`][events::EventBus] notifies subscribers of each new token
//!   and of each failure, in registration order.
//! * The [`TokenManager`] runs the background scheduling loop.
//! * The [`CredentialsProvider`] is the facade offered to clients, with both
//!   blocking and asynchronous accessors.
//!
//! # General Flow
//!
//! A token becomes due for refresh once a configured fraction of its lifetime
//! has passed. The background task requests a new token at that point, while
//! callers continue to be served the previous token until the new one is
//! committed. Failed requests are retried with a fixed delay up to a maximum
//! number of attempts.
//!
//! ```
//! use std::time::Duration;
//!
//! use credstream::{CredentialsConfig, CredentialsProvider, StaticIdentityProvider, Token};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let claims = serde_json::json!({ "oid": "service-principal" });
//! let token = Token::with_lifetime("secret-token", Duration::from_secs(3600))?
//!     .with_claims(claims.as_object().cloned().unwrap_or_default());
//!
//! let provider = CredentialsProvider::new(
//!     StaticIdentityProvider::new(token),
//!     CredentialsConfig::default().with_block_for_initial(true),
//! )?;
//!
//! provider.on_next(|token| {
//!     tracing::info!(expiry = token.expires_at().0, "received new token");
//!     Ok(())
//! });
//!
//! let (username, secret) = provider.get_credentials_async().await?;
//! assert_eq!(username.as_str(), "service-principal");
//! assert_eq!(secret.as_str(), "secret-token");
//! # Ok(())
//! # }
//! ```
//!
//! This crate includes an example of doing a periodic refresh against an OAuth2
//! authority in the examples folder. Refer to that example for more details on usage.
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `oauth2`: Provides an identity provider performing the OAuth2 _client credentials_ flow,
//!   and one requesting tokens for an Azure managed identity.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod error;
pub mod events;
mod manager;
pub mod policy;
mod provider;
pub mod sources;
mod tokens;

pub use braids::*;
pub use manager::{Acquisition, ManagerStatus, PendingToken, TokenManager, WaitFor};
pub use policy::RefreshConfig;
pub use provider::{
    CredentialsConfig, CredentialsProvider, DEFAULT_BLOCK_FOR_INITIAL, DEFAULT_INITIAL_DELAY,
};
pub use sources::{Blocking, BlockingIdentityProvider, IdentityProvider, StaticIdentityProvider};
pub use tokens::{Token, TokenError, TokenStatus};

/// The credential pair presented to a client: a username and its secret
pub type Credentials = (Username, AccessToken);
