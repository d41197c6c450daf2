use std::{future::Future, sync::Arc, time::Duration};

use credstream_clock::{Clock, System};
use tokio::runtime::Handle;

use crate::{
    error::{CallbackError, CredentialsError, ManagerError, ProviderError},
    events::{ErrorSubscriber, NextSubscriber},
    manager::{Acquisition, ManagerStatus, TokenManager, WaitFor},
    policy::RefreshConfig,
    sources::IdentityProvider,
    Credentials, Token,
};

/// The default delay before the very first token request
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(0);

/// Whether starting a provider waits for its first token by default
pub const DEFAULT_BLOCK_FOR_INITIAL: bool = false;

/// Configuration for a [`CredentialsProvider`]
#[derive(Clone, Debug, PartialEq)]
pub struct CredentialsConfig {
    refresh: RefreshConfig,
    initial_delay: Duration,
    block_for_initial: bool,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self::new(RefreshConfig::default())
    }
}

impl CredentialsConfig {
    /// Constructs a configuration using the given refresh configuration
    pub fn new(refresh: RefreshConfig) -> Self {
        Self {
            refresh,
            initial_delay: DEFAULT_INITIAL_DELAY,
            block_for_initial: DEFAULT_BLOCK_FOR_INITIAL,
        }
    }

    /// Delays the very first request to the identity provider
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Controls whether [`start()`][CredentialsProvider::start] waits for the first token
    ///
    /// When `true`, starting waits until the initial acquisition cycle either
    /// succeeds or exhausts its attempts. When `false`, the cycle is started in
    /// the background and starting returns immediately.
    ///
    /// Requests for credentials are unaffected: a caller without a valid token
    /// always waits for the pending cycle, retries included.
    pub fn with_block_for_initial(mut self, block_for_initial: bool) -> Self {
        self.block_for_initial = block_for_initial;
        self
    }

    /// The refresh configuration
    #[inline]
    pub fn refresh(&self) -> &RefreshConfig {
        &self.refresh
    }

    /// The delay before the very first token request
    #[inline]
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Whether starting waits for the first token
    #[inline]
    pub fn block_for_initial(&self) -> bool {
        self.block_for_initial
    }
}

/// Supplies continuously refreshed credentials to a client
///
/// The first request for credentials starts a background task that keeps the
/// token fresh. Subsequent requests are answered from the held token without
/// waiting on the identity provider until that token expires.
///
/// The background task can also be started ahead of the first request with
/// [`start()`][CredentialsProvider::start] or
/// [`start_async()`][CredentialsProvider::start_async].
///
/// Credentials can be requested from synchronous code with
/// [`get_credentials()`][CredentialsProvider::get_credentials] or from
/// asynchronous code with
/// [`get_credentials_async()`][CredentialsProvider::get_credentials_async].
///
/// Dropping the provider stops the background task.
#[derive(Debug)]
pub struct CredentialsProvider<P, C = System> {
    manager: TokenManager<P, C>,
    block_for_initial: bool,
}

impl<P: IdentityProvider> CredentialsProvider<P, System> {
    /// Constructs a credentials provider that runs on the current tokio runtime
    ///
    /// Fails if not called from within a tokio runtime.
    pub fn new(provider: P, config: CredentialsConfig) -> Result<Self, ProviderError> {
        Ok(Self::with_handle(provider, config, Handle::try_current()?))
    }

    /// Constructs a credentials provider that runs on the given runtime
    pub fn with_handle(provider: P, config: CredentialsConfig, handle: Handle) -> Self {
        Self::with_clock(provider, config, handle, System)
    }
}

impl<P, C> CredentialsProvider<P, C>
where
    P: IdentityProvider,
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Constructs a credentials provider using a custom clock
    pub fn with_clock(provider: P, config: CredentialsConfig, handle: Handle, clock: C) -> Self {
        let manager = TokenManager::with_clock(provider, config.refresh, handle, clock)
            .with_initial_delay(config.initial_delay);

        Self {
            manager,
            block_for_initial: config.block_for_initial,
        }
    }

    /// Starts the background refresh task, blocking the calling thread if
    /// configured to wait for the first token
    ///
    /// Starting is optional: the first request for credentials starts the task.
    ///
    /// # Panics
    ///
    /// Panics if called within an asynchronous execution context while
    /// configured to wait for the first token.
    pub fn start(&self) -> Result<(), CredentialsError> {
        match self.manager.acquire(WaitFor::Cycle)? {
            Acquisition::Pending(pending) if self.block_for_initial => {
                pending.blocking_wait()?;
            }
            _ => {}
        }

        Ok(())
    }

    /// Starts the background refresh task, suspending the calling task if
    /// configured to wait for the first token
    pub async fn start_async(&self) -> Result<(), CredentialsError> {
        match self.manager.acquire(WaitFor::Cycle)? {
            Acquisition::Pending(pending) if self.block_for_initial => {
                pending.wait().await?;
            }
            _ => {}
        }

        Ok(())
    }

    /// Obtains credentials, blocking the calling thread if a token must be acquired
    ///
    /// # Panics
    ///
    /// Panics if called within an asynchronous execution context. Use
    /// [`get_credentials_async()`][Self::get_credentials_async] there instead.
    pub fn get_credentials(&self) -> Result<Credentials, CredentialsError> {
        let token = self.manager.acquire_token(WaitFor::Cycle)?;
        self.manager.provider().credentials_for(&token)
    }

    /// Obtains credentials, suspending the calling task if a token must be acquired
    pub async fn get_credentials_async(&self) -> Result<Credentials, CredentialsError> {
        let token = self.manager.acquire_token_async(WaitFor::Cycle).await?;
        self.manager.provider().credentials_for(&token)
    }

    /// Registers a callback invoked with every newly acquired token
    pub fn on_next<F>(&self, f: F)
    where
        F: Fn(Arc<Token>) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.subscribe_next(NextSubscriber::sync(f));
    }

    /// Registers an asynchronous callback invoked with every newly acquired token
    pub fn on_next_async<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<Token>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.subscribe_next(NextSubscriber::from_async(f));
    }

    /// Registers a callback invoked with every acquisition or subscriber error
    ///
    /// If the callback itself fails, automatic refreshes are halted until
    /// credentials are next requested.
    pub fn on_error<F>(&self, f: F)
    where
        F: Fn(ManagerError) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.subscribe_error(ErrorSubscriber::sync(f));
    }

    /// Registers an asynchronous callback invoked with every acquisition or subscriber error
    pub fn on_error_async<F, Fut>(&self, f: F)
    where
        F: Fn(ManagerError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
    {
        self.subscribe_error(ErrorSubscriber::from_async(f));
    }

    /// Appends a token subscriber
    pub fn subscribe_next(&self, subscriber: NextSubscriber) {
        self.manager.events().register_next(subscriber);
    }

    /// Appends an error subscriber
    pub fn subscribe_error(&self, subscriber: ErrorSubscriber) {
        self.manager.events().register_error(subscriber);
    }

    /// The underlying token manager
    pub fn manager(&self) -> &TokenManager<P, C> {
        &self.manager
    }
}

impl<P, C> CredentialsProvider<P, C> {
    /// The most recently acquired token, without waiting on the identity provider
    pub fn current_token(&self) -> Option<Arc<Token>> {
        self.manager.current_token()
    }

    /// Whether the background refresh task has been started
    pub fn is_streaming(&self) -> bool {
        self.manager.is_running()
    }

    /// The state of the underlying token manager
    pub fn status(&self) -> ManagerStatus {
        self.manager.status()
    }

    /// Stops the background refresh task
    ///
    /// Later requests for credentials fail with [`CredentialsError::Closed`].
    pub fn close(&self) {
        self.manager.close();
    }
}
