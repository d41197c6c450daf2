//! Token lifecycle event distribution
//!
//! The [`EventBus`] owns two ordered, append-only subscriber lists: one for
//! newly acquired tokens and one for errors. Dispatch visits subscribers in
//! registration order, awaiting each before moving to the next, whether the
//! subscriber body is synchronous or asynchronous.

use std::{fmt, future::Future, pin::Pin, sync::Arc};

use parking_lot::RwLock;

use crate::{
    error::{CallbackError, ErrorHandlerError, ManagerError},
    Token,
};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

enum Handler<T> {
    Sync(Box<dyn Fn(T) -> Result<(), CallbackError> + Send + Sync>),
    Async(Box<dyn Fn(T) -> BoxFuture<Result<(), CallbackError>> + Send + Sync>),
}

impl<T> Handler<T> {
    async fn call(&self, arg: T) -> Result<(), CallbackError> {
        match self {
            Handler::Sync(f) => f(arg),
            Handler::Async(f) => f(arg).await,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Handler::Sync(_) => "sync",
            Handler::Async(_) => "async",
        }
    }
}

macro_rules! subscriber {
    ($(#[$meta:meta])* $name:ident($arg:ty)) => {
        $(#[$meta])*
        pub struct $name(Handler<$arg>);

        impl $name {
            /// Wraps a synchronous callback
            pub fn sync<F>(f: F) -> Self
            where
                F: Fn($arg) -> Result<(), CallbackError> + Send + Sync + 'static,
            {
                Self(Handler::Sync(Box::new(f)))
            }

            /// Wraps an asynchronous callback
            pub fn from_async<F, Fut>(f: F) -> Self
            where
                F: Fn($arg) -> Fut + Send + Sync + 'static,
                Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
            {
                Self(Handler::Async(Box::new(move |arg| Box::pin(f(arg)))))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.0.kind()).finish()
            }
        }
    };
}

subscriber! {
    /// A subscriber notified whenever a new token is committed
    NextSubscriber(Arc<Token>)
}

subscriber! {
    /// A subscriber notified whenever an acquisition cycle or token subscriber fails
    ErrorSubscriber(ManagerError)
}

/// Ordered registry of token and error subscribers
#[derive(Default)]
pub struct EventBus {
    next: RwLock<Vec<Arc<NextSubscriber>>>,
    error: RwLock<Vec<Arc<ErrorSubscriber>>>,
}

impl EventBus {
    /// Constructs an empty event bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a token subscriber
    pub fn register_next(&self, subscriber: NextSubscriber) {
        self.next.write().push(Arc::new(subscriber));
    }

    /// Appends an error subscriber
    pub fn register_error(&self, subscriber: ErrorSubscriber) {
        self.error.write().push(Arc::new(subscriber));
    }

    /// The number of registered token and error subscribers
    pub fn subscriber_counts(&self) -> (usize, usize) {
        (self.next.read().len(), self.error.read().len())
    }

    /// Notifies every token subscriber of `token`, in registration order
    ///
    /// A failing token subscriber has its error forwarded to the error
    /// subscribers, after which the remaining token subscribers still run.
    /// Fails only if an error subscriber fails.
    pub async fn dispatch_next(&self, token: &Arc<Token>) -> Result<(), ErrorHandlerError> {
        let subscribers = self.next.read().clone();
        tracing::trace!(subscribers = subscribers.len(), "dispatching new token");

        for subscriber in subscribers {
            if let Err(error) = subscriber.0.call(Arc::clone(token)).await {
                tracing::debug!(
                    error = (&*error as &dyn std::error::Error),
                    "token subscriber failed, forwarding to error subscribers"
                );
                self.dispatch_error(ManagerError::Callback(Arc::from(error)))
                    .await?;
            }
        }

        Ok(())
    }

    /// Notifies every error subscriber of `error`, in registration order
    ///
    /// Stops at the first error subscriber that fails.
    pub async fn dispatch_error(&self, error: ManagerError) -> Result<(), ErrorHandlerError> {
        let subscribers = self.error.read().clone();
        if subscribers.is_empty() {
            tracing::debug!(
                error = (&error as &dyn std::error::Error),
                "no error subscribers registered, dropping error"
            );
        }

        for subscriber in subscribers {
            subscriber
                .0
                .call(error.clone())
                .await
                .map_err(ErrorHandlerError::new)?;
        }

        Ok(())
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (next, error) = self.subscriber_counts();
        f.debug_struct("EventBus")
            .field("next", &next)
            .field("error", &error)
            .finish()
    }
}
