use std::{
    error::Error,
    fmt,
    future::pending,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use credstream_clock::{Clock, System, UnixTime};
use parking_lot::{Mutex, RwLock};
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot, watch},
    task::AbortHandle,
};

use crate::{
    error::{
        AcquisitionAborted, AcquisitionError, CredentialsError, ErrorHandlerError, ExpiredToken,
        ManagerError, RequestTimedOut, SharedError,
    },
    events::EventBus,
    policy::{RefreshConfig, RetryDecision, RetryPolicy, RetryState},
    sources::IdentityProvider,
    Token,
};

/// The longest the scheduling loop sleeps before rechecking the wall clock
const HEARTBEAT: Duration = Duration::from_secs(30);

type Reply = oneshot::Sender<Result<Arc<Token>, AcquisitionError>>;

/// How long a request waits when the manager holds no valid token
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitFor {
    /// Until the acquisition cycle succeeds or exhausts its attempts
    Cycle,
    /// Until the next attempt within the acquisition cycle resolves
    ///
    /// A failed attempt is reported to the caller while the cycle keeps
    /// retrying in the background.
    NextAttempt,
}

/// The state of a token manager
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManagerStatus {
    /// No token is held and nothing has been requested
    Idle,
    /// A request to the identity provider is in flight
    Acquiring,
    /// A token is held
    Valid,
    /// The last attempt failed and attempts remain in this cycle
    Retrying,
    /// The last acquisition cycle exhausted its attempts
    ///
    /// When a background refresh fails, the token from the earlier cycle is
    /// kept and still served until it expires.
    Failed,
    /// The manager has been closed
    Stopped,
}

/// The outcome of asking the manager for a token
#[derive(Debug)]
pub enum Acquisition {
    /// A valid token was already held
    Ready(Arc<Token>),
    /// The token is still being acquired
    Pending(PendingToken),
}

/// A completion handle for a token that is still being acquired
///
/// The same handle can be awaited from async code or waited on from a
/// synchronous thread.
#[derive(Debug)]
pub struct PendingToken {
    rx: oneshot::Receiver<Result<Arc<Token>, AcquisitionError>>,
}

impl PendingToken {
    /// Waits for the acquisition to resolve
    pub async fn wait(self) -> Result<Arc<Token>, CredentialsError> {
        Ok(self.rx.await.map_err(|_| CredentialsError::Closed)??)
    }

    /// Blocks the current thread until the acquisition resolves
    ///
    /// # Panics
    ///
    /// Panics if called within an asynchronous execution context.
    pub fn blocking_wait(self) -> Result<Arc<Token>, CredentialsError> {
        Ok(self.rx.blocking_recv().map_err(|_| CredentialsError::Closed)??)
    }
}

enum Command {
    Acquire { wait: WaitFor, reply: Reply },
}

#[derive(Debug)]
struct Shared {
    status: Mutex<ManagerStatus>,
    halted: AtomicBool,
}

impl Shared {
    fn set_status(&self, status: ManagerStatus) {
        *self.status.lock() = status;
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn set_halted(&self, halted: bool) -> bool {
        self.halted.swap(halted, Ordering::AcqRel)
    }
}

enum Lifecycle {
    NotStarted(watch::Sender<Option<Arc<Token>>>),
    Running {
        commands: mpsc::UnboundedSender<Command>,
        abort: AbortHandle,
    },
    Stopped,
}

/// Manages the lifecycle of a single token
///
/// The manager owns a background scheduling loop, started on the first
/// request for a token, which performs every acquisition against the
/// identity provider. At most one acquisition cycle is in flight at a time;
/// concurrent requests attach to the pending cycle. Once a token is held,
/// the loop refreshes it ahead of expiry according to the [`RefreshConfig`]
/// and reports every new token and every failure through the [`EventBus`].
pub struct TokenManager<P, C = System> {
    provider: Arc<P>,
    config: RefreshConfig,
    initial_delay: Duration,
    events: Arc<EventBus>,
    clock: C,
    handle: Handle,
    current: RwLock<Option<watch::Receiver<Option<Arc<Token>>>>>,
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

impl<P: IdentityProvider> TokenManager<P, System> {
    /// Constructs a new token manager whose scheduling loop will run on `handle`
    pub fn new(provider: P, config: RefreshConfig, handle: Handle) -> Self {
        Self::with_clock(provider, config, handle, System)
    }
}

impl<P, C> TokenManager<P, C>
where
    P: IdentityProvider,
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Constructs a new token manager using the given clock
    pub fn with_clock(provider: P, config: RefreshConfig, handle: Handle, clock: C) -> Self {
        let (publisher, current) = watch::channel(None);
        Self {
            provider: Arc::new(provider),
            config,
            initial_delay: Duration::ZERO,
            events: Arc::new(EventBus::new()),
            clock,
            handle,
            current: RwLock::new(Some(current)),
            shared: Arc::new(Shared {
                status: Mutex::new(ManagerStatus::Idle),
                halted: AtomicBool::new(false),
            }),
            lifecycle: Mutex::new(Lifecycle::NotStarted(publisher)),
        }
    }

    /// Delays the very first request to the identity provider
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Uses an existing event bus for lifecycle notifications
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// The identity provider tokens are requested from
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The event bus lifecycle notifications are dispatched through
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// The refresh configuration
    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// Requests a valid token
    ///
    /// Returns the held token if it is still valid. Otherwise starts the
    /// scheduling loop if required, attaches to the pending acquisition
    /// cycle (starting one if none is in flight), and returns a handle that
    /// resolves as described by `wait`.
    pub fn acquire(&self, wait: WaitFor) -> Result<Acquisition, CredentialsError> {
        if self.is_closed() {
            return Err(CredentialsError::Closed);
        }

        if let Some(token) = self.usable_token() {
            return Ok(Acquisition::Ready(token));
        }

        let commands = self.ensure_started()?;
        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::Acquire { wait, reply })
            .map_err(|_| CredentialsError::Closed)?;

        Ok(Acquisition::Pending(PendingToken { rx }))
    }

    /// Requests a valid token, suspending the calling task until one is available
    pub async fn acquire_token_async(&self, wait: WaitFor) -> Result<Arc<Token>, CredentialsError> {
        match self.acquire(wait)? {
            Acquisition::Ready(token) => Ok(token),
            Acquisition::Pending(pending) => pending.wait().await,
        }
    }

    /// Requests a valid token, blocking the calling thread until one is available
    ///
    /// # Panics
    ///
    /// Panics if called within an asynchronous execution context.
    pub fn acquire_token(&self, wait: WaitFor) -> Result<Arc<Token>, CredentialsError> {
        match self.acquire(wait)? {
            Acquisition::Ready(token) => Ok(token),
            Acquisition::Pending(pending) => pending.blocking_wait(),
        }
    }

    fn usable_token(&self) -> Option<Arc<Token>> {
        if self.shared.is_halted() {
            return None;
        }

        let now = self.clock.now();
        self.current
            .read()
            .as_ref()?
            .borrow()
            .as_ref()
            .filter(|t| !t.is_expired_at(now))
            .cloned()
    }

    fn ensure_started(&self) -> Result<mpsc::UnboundedSender<Command>, CredentialsError> {
        let mut lifecycle = self.lifecycle.lock();
        let (commands, next) = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running { commands, abort } => {
                (commands.clone(), Lifecycle::Running { commands, abort })
            }
            Lifecycle::NotStarted(publisher) => {
                let (commands, rx) = mpsc::unbounded_channel();
                let abort = self.spawn(publisher, rx);
                (commands.clone(), Lifecycle::Running { commands, abort })
            }
            Lifecycle::Stopped => return Err(CredentialsError::Closed),
        };

        *lifecycle = next;
        Ok(commands)
    }

    fn spawn(
        &self,
        publisher: watch::Sender<Option<Arc<Token>>>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> AbortHandle {
        let scheduler = Scheduler {
            provider: Arc::clone(&self.provider),
            config: self.config.clone(),
            initial_delay: Some(self.initial_delay),
            events: Arc::clone(&self.events),
            clock: self.clock.clone(),
            publisher,
            shared: Arc::clone(&self.shared),
            cycle: None,
            refresh_at: None,
        };

        let join = self.handle.spawn(scheduler.run(commands));
        let abort = join.abort_handle();

        self.handle.spawn(async move {
            match join.await {
                Ok(()) => tracing::info!("token manager stopped"),
                Err(err) if err.is_panic() => tracing::error!("token manager panicked!"),
                Err(_) => tracing::info!("token manager was cancelled"),
            }
        });

        tracing::debug!("started token manager");
        abort
    }
}

impl<P, C> TokenManager<P, C> {
    /// The most recently committed token, if any
    ///
    /// This never waits on the identity provider. The token may have expired.
    /// A closed manager holds no token.
    pub fn current_token(&self) -> Option<Arc<Token>> {
        self.current.read().as_ref()?.borrow().clone()
    }

    /// The manager's current state
    pub fn status(&self) -> ManagerStatus {
        *self.shared.status.lock()
    }

    /// Whether automatic refreshes have been halted by a failing error subscriber
    pub fn is_halted(&self) -> bool {
        self.shared.is_halted()
    }

    /// Whether the background scheduling loop is running
    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running { .. })
    }

    /// Whether the manager has been closed
    pub fn is_closed(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Stopped)
    }

    /// Stops the scheduling loop
    ///
    /// Pending refresh timers are disarmed and no further notifications are
    /// dispatched. A request already in flight is allowed to complete, but its
    /// result is discarded. The held token is released, and later requests
    /// fail with [`CredentialsError::Closed`].
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        if let Lifecycle::Running { abort, .. } = previous {
            tracing::debug!("stopping token manager");
            abort.abort();
        }

        self.current.write().take();

        self.shared.set_status(ManagerStatus::Stopped);
    }
}

impl<P, C> Drop for TokenManager<P, C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<P, C> fmt::Debug for TokenManager<P, C>
where
    P: fmt::Debug,
    C: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("provider", &self.provider)
            .field("config", &self.config)
            .field("initial_delay", &self.initial_delay)
            .field("events", &self.events)
            .field("clock", &self.clock)
            .field("status", &self.status())
            .finish()
    }
}

enum AttemptOutcome {
    Retrying { attempt: u32, error: SharedError },
    Finished(Result<Token, AcquisitionError>),
}

struct Cycle {
    outcomes: mpsc::UnboundedReceiver<AttemptOutcome>,
    until_done: Vec<Reply>,
    until_attempt: Vec<Reply>,
}

struct Scheduler<P, C> {
    provider: Arc<P>,
    config: RefreshConfig,
    initial_delay: Option<Duration>,
    events: Arc<EventBus>,
    clock: C,
    publisher: watch::Sender<Option<Arc<Token>>>,
    shared: Arc<Shared>,
    cycle: Option<Cycle>,
    refresh_at: Option<UnixTime>,
}

impl<P, C> Scheduler<P, C>
where
    P: IdentityProvider,
    C: Clock + Clone + Send + Sync + 'static,
{
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            // The timer does not advance while a machine is suspended, so we
            // wake at least every heartbeat to recheck the wall clock.
            let timer = self
                .refresh_at
                .map(|due| (due - self.clock.now()).min(HEARTBEAT));

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Acquire { wait, reply }) => self.on_acquire(wait, reply),
                    None => {
                        tracing::info!("no one is requesting tokens anymore, halting refreshes");
                        return;
                    }
                },
                outcome = next_outcome(&mut self.cycle) => self.on_outcome(outcome).await,
                () = sleep_for(timer) => self.on_timer(),
            }
        }
    }

    fn valid_token(&self, now: UnixTime) -> Option<Arc<Token>> {
        self.publisher
            .borrow()
            .as_ref()
            .filter(|t| !t.is_expired_at(now))
            .cloned()
    }

    fn on_acquire(&mut self, wait: WaitFor, reply: Reply) {
        let now = self.clock.now();

        if let Some(token) = self.valid_token(now) {
            if self.shared.set_halted(false) {
                tracing::info!("resuming automatic refresh");
                self.schedule_refresh(&token, now);
                if self.refresh_at.is_none() {
                    self.start_cycle();
                }
            }

            let _ = reply.send(Ok(token));
            return;
        }

        self.shared.set_halted(false);
        self.start_cycle();

        if let Some(cycle) = &mut self.cycle {
            match wait {
                WaitFor::Cycle => cycle.until_done.push(reply),
                WaitFor::NextAttempt => cycle.until_attempt.push(reply),
            }
        }
    }

    fn on_timer(&mut self) {
        let Some(due) = self.refresh_at else {
            return;
        };

        let now = self.clock.now();
        if now < due {
            tracing::trace!(
                until_due_ms = (due - now).as_millis() as u64,
                "token not yet due, sleeping…"
            );
            return;
        }

        tracing::trace!("token now due");
        self.refresh_at = None;
        self.start_cycle();
    }

    fn start_cycle(&mut self) {
        if self.cycle.is_some() {
            return;
        }

        let (tx, outcomes) = mpsc::unbounded_channel();
        tokio::spawn(acquire(
            Arc::clone(&self.provider),
            self.config.retry(),
            self.config.request_timeout(),
            self.initial_delay.take(),
            self.clock.clone(),
            tx,
        ));

        self.cycle = Some(Cycle {
            outcomes,
            until_done: Vec::new(),
            until_attempt: Vec::new(),
        });
        self.shared.set_status(ManagerStatus::Acquiring);
    }

    async fn on_outcome(&mut self, outcome: Option<AttemptOutcome>) {
        match outcome {
            Some(AttemptOutcome::Retrying { attempt, error }) => {
                self.shared.set_status(ManagerStatus::Retrying);
                if let Some(cycle) = &mut self.cycle {
                    for reply in cycle.until_attempt.drain(..) {
                        let _ = reply.send(Err(AcquisitionError::new(attempt, Arc::clone(&error))));
                    }
                }
            }
            Some(AttemptOutcome::Finished(result)) => self.finish_cycle(result).await,
            None => {
                let error = AcquisitionError::new(0, Arc::new(AcquisitionAborted));
                self.finish_cycle(Err(error)).await
            }
        }
    }

    async fn finish_cycle(&mut self, result: Result<Token, AcquisitionError>) {
        let Some(Cycle {
            until_done,
            until_attempt,
            ..
        }) = self.cycle.take()
        else {
            return;
        };
        let waiters = until_done.into_iter().chain(until_attempt);

        match result {
            Ok(token) => {
                let token = Arc::new(token);
                let now = self.clock.now();
                let replaced = self.commit(&token);

                self.shared.set_status(ManagerStatus::Valid);
                self.schedule_refresh(&token, now);

                if replaced {
                    if let Err(error) = self.events.dispatch_next(&token).await {
                        self.halt(&error);
                    }
                } else {
                    tracing::debug!("identity provider returned the token already held");
                }

                for reply in waiters {
                    let _ = reply.send(Ok(Arc::clone(&token)));
                }
            }
            Err(error) => {
                self.shared.set_status(ManagerStatus::Failed);
                self.refresh_at = None;

                tracing::warn!(
                    error = (&error as &dyn Error),
                    holding_valid_token = self.valid_token(self.clock.now()).is_some(),
                    "acquisition cycle failed"
                );

                let event = ManagerError::Acquisition(error.clone());
                if let Err(fatal) = self.events.dispatch_error(event).await {
                    self.halt(&fatal);
                }

                for reply in waiters {
                    let _ = reply.send(Err(error.clone()));
                }
            }
        }
    }

    /// Publishes `token`, returning whether it differs from the token already held
    fn commit(&mut self, token: &Arc<Token>) -> bool {
        let unchanged = self
            .publisher
            .borrow()
            .as_ref()
            .map_or(false, |held| **held == **token);

        if !unchanged {
            self.publisher.send_replace(Some(Arc::clone(token)));
            tracing::info!(
                issued = token.issued_at().0,
                expiry = token.expires_at().0,
                "committed new token"
            );
        }

        !unchanged
    }

    fn schedule_refresh(&mut self, token: &Token, now: UnixTime) {
        let due = self.config.refresh_deadline(token);
        if due <= now {
            tracing::warn!(
                due = due.0,
                expiry = token.expires_at().0,
                "token was already due for refresh on arrival, suspending automatic refresh"
            );
            self.refresh_at = None;
        } else {
            tracing::debug!(
                due = due.0,
                delay_ms = (due - now).as_millis() as u64,
                "waiting for token to become due"
            );
            self.refresh_at = Some(due);
        }
    }

    fn halt(&mut self, error: &ErrorHandlerError) {
        tracing::error!(
            error = (error as &dyn Error),
            "error subscriber failed, halting automatic refresh"
        );
        self.refresh_at = None;
        self.shared.set_halted(true);
    }
}

async fn next_outcome(cycle: &mut Option<Cycle>) -> Option<AttemptOutcome> {
    match cycle {
        Some(cycle) => cycle.outcomes.recv().await,
        None => pending().await,
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => pending().await,
    }
}

async fn acquire<P, C>(
    provider: Arc<P>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    initial_delay: Option<Duration>,
    clock: C,
    outcomes: mpsc::UnboundedSender<AttemptOutcome>,
) where
    P: IdentityProvider,
    C: Clock,
{
    if let Some(delay) = initial_delay.filter(|d| !d.is_zero()) {
        tracing::debug!(
            delay_ms = delay.as_millis() as u64,
            "delaying initial token request"
        );
        tokio::time::sleep(delay).await;
    }

    let mut retry = RetryState::new(retry);
    loop {
        tracing::debug!(attempt = retry.failures() + 1, "requesting new token");

        let error = match request_once(&*provider, timeout, &clock).await {
            Ok(token) => {
                let _ = outcomes.send(AttemptOutcome::Finished(Ok(token)));
                return;
            }
            Err(error) => error,
        };

        match retry.record_failure() {
            RetryDecision::RetryAfter(delay) => {
                tracing::warn!(
                    error = (&*error as &dyn Error),
                    attempt = retry.failures(),
                    delay_ms = delay.as_millis() as u64,
                    "error requesting token, will retry"
                );

                let attempt = retry.failures();
                if outcomes
                    .send(AttemptOutcome::Retrying { attempt, error })
                    .is_err()
                {
                    tracing::debug!("token manager stopped, abandoning acquisition");
                    return;
                }

                tokio::time::sleep(delay).await;
                if outcomes.is_closed() {
                    tracing::debug!("token manager stopped, abandoning acquisition");
                    return;
                }
            }
            RetryDecision::GiveUp => {
                tracing::warn!(
                    error = (&*error as &dyn Error),
                    attempts = retry.failures(),
                    "error requesting token, giving up"
                );
                let error = AcquisitionError::new(retry.failures(), error);
                let _ = outcomes.send(AttemptOutcome::Finished(Err(error)));
                return;
            }
        }
    }
}

async fn request_once<P, C>(
    provider: &P,
    timeout: Option<Duration>,
    clock: &C,
) -> Result<Token, SharedError>
where
    P: IdentityProvider,
    C: Clock,
{
    let result = match timeout {
        Some(limit) => tokio::time::timeout(limit, provider.request_token())
            .await
            .map_err(|_| Arc::new(RequestTimedOut(limit)) as SharedError)?,
        None => provider.request_token().await,
    };

    let token = result.map_err(|e| Arc::new(e) as SharedError)?;
    if token.is_expired_at(clock.now()) {
        return Err(Arc::new(ExpiredToken));
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use color_eyre::Result;
    use credstream_clock::TestClock;
    use tracing_test::traced_test;

    use super::*;

    #[derive(Debug)]
    struct Counting {
        calls: Arc<AtomicUsize>,
        clock: TestClock,
        lifetime: Duration,
    }

    #[async_trait]
    impl IdentityProvider for Counting {
        type Error = std::io::Error;

        async fn request_token(&self) -> Result<Token, Self::Error> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            Token::with_lifetime_and_clock(format!("token-{}", n), self.lifetime, &self.clock)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        }
    }

    fn counting(clock: &TestClock, lifetime: Duration) -> (Counting, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = Counting {
            calls: Arc::clone(&calls),
            clock: clock.clone(),
            lifetime,
        };
        (provider, calls)
    }

    #[tokio::test]
    #[traced_test]
    async fn concurrent_requests_share_one_cycle() -> Result<()> {
        let clock = TestClock::new(UnixTime::from_secs(1_000));
        let (provider, calls) = counting(&clock, Duration::from_secs(3600));
        let manager = TokenManager::with_clock(
            provider,
            RefreshConfig::default(),
            Handle::current(),
            clock,
        );

        let (a, b, c) = tokio::join!(
            manager.acquire_token_async(WaitFor::Cycle),
            manager.acquire_token_async(WaitFor::NextAttempt),
            manager.acquire_token_async(WaitFor::Cycle),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a?.value().as_str(), "token-1");
        assert_eq!(b?.value().as_str(), "token-1");
        assert_eq!(c?.value().as_str(), "token-1");
        assert_eq!(manager.status(), ManagerStatus::Valid);
        Ok(())
    }

    #[tokio::test]
    async fn expired_tokens_are_replaced_on_request() -> Result<()> {
        let clock = TestClock::new(UnixTime::from_secs(1_000));
        let (provider, calls) = counting(&clock, Duration::from_secs(3600));
        let manager = TokenManager::with_clock(
            provider,
            RefreshConfig::default(),
            Handle::current(),
            clock.clone(),
        );

        let first = manager.acquire_token_async(WaitFor::Cycle).await?;
        let again = manager.acquire_token_async(WaitFor::Cycle).await?;
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(7200));
        let renewed = manager.acquire_token_async(WaitFor::Cycle).await?;
        assert_eq!(renewed.value().as_str(), "token-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[derive(Debug)]
    struct Stalled;

    #[async_trait]
    impl IdentityProvider for Stalled {
        type Error = std::io::Error;

        async fn request_token(&self) -> Result<Token, Self::Error> {
            pending().await
        }
    }

    #[tokio::test]
    async fn request_timeout_counts_as_a_failed_attempt() -> Result<()> {
        let config = RefreshConfig::new(
            0.8,
            Duration::ZERO,
            RetryPolicy::new(2, Duration::from_millis(5))?,
        )?
        .with_request_timeout(Duration::from_millis(20));
        let manager = TokenManager::new(Stalled, config, Handle::current());

        let err = manager
            .acquire_token_async(WaitFor::Cycle)
            .await
            .unwrap_err();
        match err {
            CredentialsError::Acquisition(err) => {
                assert_eq!(err.attempts(), 2);
                assert!(err.last_error().is::<RequestTimedOut>());
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(manager.status(), ManagerStatus::Failed);
        Ok(())
    }

    #[tokio::test]
    async fn expired_tokens_from_the_provider_are_rejected() -> Result<()> {
        let clock = TestClock::new(UnixTime::from_secs(1_000));
        let stale = Token::new("stale", UnixTime::from_secs(10), UnixTime::from_secs(20))?;
        let config = RefreshConfig::new(0.8, Duration::ZERO, RetryPolicy::new(1, Duration::ZERO)?)?;
        let manager = TokenManager::with_clock(
            crate::StaticIdentityProvider::new(stale),
            config,
            Handle::current(),
            clock,
        );

        let err = manager
            .acquire_token_async(WaitFor::Cycle)
            .await
            .unwrap_err();
        match err {
            CredentialsError::Acquisition(err) => assert!(err.last_error().is::<ExpiredToken>()),
            other => panic!("unexpected error: {}", other),
        }
        Ok(())
    }

    #[derive(Debug)]
    struct FailsOnce {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl IdentityProvider for FailsOnce {
        type Error = std::io::Error;

        async fn request_token(&self) -> Result<Token, Self::Error> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "authority unavailable",
                ));
            }

            Token::with_lifetime("recovered", Duration::from_secs(3600))
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        }
    }

    #[tokio::test]
    async fn next_attempt_waiters_see_the_first_failure_while_cycle_waiters_see_the_token(
    ) -> Result<()> {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = RefreshConfig::new(
            0.8,
            Duration::ZERO,
            RetryPolicy::new(3, Duration::from_millis(30))?,
        )?;
        let manager = TokenManager::new(
            FailsOnce {
                calls: Arc::clone(&calls),
            },
            config,
            Handle::current(),
        );

        let (eager, patient) = tokio::join!(
            manager.acquire_token_async(WaitFor::NextAttempt),
            manager.acquire_token_async(WaitFor::Cycle),
        );

        match eager {
            Err(CredentialsError::Acquisition(err)) => assert_eq!(err.attempts(), 1),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(patient?.value().as_str(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(manager.status(), ManagerStatus::Valid);
        Ok(())
    }

    #[tokio::test]
    async fn closing_stops_the_manager() -> Result<()> {
        let clock = TestClock::new(UnixTime::from_secs(1_000));
        let (provider, _) = counting(&clock, Duration::from_secs(3600));
        let manager =
            TokenManager::with_clock(provider, RefreshConfig::default(), Handle::current(), clock);

        manager.acquire_token_async(WaitFor::Cycle).await?;
        assert!(manager.is_running());

        manager.close();
        assert!(manager.is_closed());
        assert!(!manager.is_running());
        assert_eq!(manager.status(), ManagerStatus::Stopped);
        assert!(manager.current_token().is_none());
        assert!(matches!(
            manager.acquire_token_async(WaitFor::Cycle).await,
            Err(CredentialsError::Closed)
        ));
        Ok(())
    }
}
