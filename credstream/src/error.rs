//! Errors surfaced by the token manager and credentials provider

use std::{error::Error, sync::Arc, time::Duration};

use thiserror::Error;

/// A shareable error from an identity provider or subscriber
pub type SharedError = Arc<dyn Error + Send + Sync + 'static>;

/// An error returned by a subscriber callback
pub type CallbackError = Box<dyn Error + Send + Sync + 'static>;

/// The identity provider failed to produce a token
///
/// Carries the number of attempts made in the acquisition cycle and the
/// error from the final attempt.
#[derive(Clone, Debug, Error)]
#[error("unable to acquire a token after {attempts} attempt(s)")]
pub struct AcquisitionError {
    attempts: u32,
    #[source]
    source: SharedError,
}

impl AcquisitionError {
    pub(crate) fn new(attempts: u32, source: SharedError) -> Self {
        Self { attempts, source }
    }

    /// The number of attempts made before giving up
    #[inline]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The error reported by the identity provider on the last attempt
    #[inline]
    pub fn last_error(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.source
    }
}

/// An error delivered to error subscribers
#[derive(Clone, Debug, Error)]
pub enum ManagerError {
    /// An acquisition cycle failed after exhausting its attempts
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    /// A token subscriber failed while handling a new token
    ///
    /// The error is forwarded exactly as the subscriber returned it.
    #[error(transparent)]
    Callback(SharedError),
}

/// An error subscriber itself failed
///
/// This halts automatic refreshes until the next explicit acquisition.
#[derive(Clone, Debug, Error)]
#[error("error subscriber failed")]
pub struct ErrorHandlerError {
    #[source]
    source: SharedError,
}

impl ErrorHandlerError {
    pub(crate) fn new(source: CallbackError) -> Self {
        Self {
            source: Arc::from(source),
        }
    }
}

/// An error obtaining credentials
#[derive(Debug, Error)]
pub enum CredentialsError {
    /// No token could be acquired
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    /// The token does not identify a principal to use as the username
    #[error("token does not carry a username claim (tried {tried:?})")]
    MissingUsername {
        /// The claims that were consulted
        tried: &'static [&'static str],
    },
    /// The credentials provider has been closed
    #[error("credentials provider has been closed")]
    Closed,
}

/// An error constructing a credentials provider
#[derive(Debug, Error)]
pub enum ProviderError {
    /// There was no tokio runtime available to run the token manager
    #[error("a tokio runtime is required to run the token manager")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// A single identity provider request did not complete in time
#[derive(Clone, Copy, Debug, Error)]
#[error("identity provider did not respond within {0:?}")]
pub struct RequestTimedOut(pub Duration);

/// The identity provider handed back a token that had already expired
#[derive(Clone, Copy, Debug, Error)]
#[error("identity provider returned an expired token")]
pub struct ExpiredToken;

/// The acquisition task ended without reporting an outcome
#[derive(Clone, Copy, Debug, Error)]
#[error("acquisition task ended unexpectedly")]
pub(crate) struct AcquisitionAborted;
