//! # Shutdown Coordination
//!
//! A clonable handle that runs registered cleanup callbacks exactly once.
//!
//! ```text
//! register(a) register(b) register(c)      shutdown()
//!                                              │
//!                                   c ──► b ──► a   (reverse order)
//!                                              │
//!                                          done() resolves
//! ```
//!
//! Later registrations usually depend on earlier ones, so they are torn
//! down first. Each callback runs under the `io.magiksnap.shutdown`
//! timeout from the process-wide registry.

use crate::constants::SHUTDOWN_TIMEOUT_KEY;
use crate::error::{Error, Result};
use crate::timeout;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

type Callback = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send>;

#[derive(Default)]
struct State {
    started: bool,
    callbacks: Vec<Callback>,
    first_error: Option<String>,
}

struct Inner {
    state: Mutex<State>,
    done: watch::Sender<bool>,
}

/// Handle to a shared shutdown sequence.
#[derive(Clone)]
pub struct ShutdownService {
    inner: Arc<Inner>,
}

impl Default for ShutdownService {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownService {
    /// Creates a service with no callbacks.
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                done,
            }),
        }
    }

    /// Registers a callback to run on shutdown.
    ///
    /// Callbacks registered once shutdown has begun are dropped.
    pub fn register_callback<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let Ok(mut state) = self.inner.state.lock() else {
            warn!("shutdown state poisoned, dropping callback");
            return;
        };
        if state.started {
            warn!("shutdown already started, dropping callback");
            return;
        }
        state
            .callbacks
            .push(Box::new(move || Box::pin(callback())));
    }

    /// Runs all callbacks and marks the service done.
    ///
    /// Calling this more than once is harmless; later calls wait for the
    /// first to finish.
    pub async fn shutdown(&self) {
        let callbacks = match self.inner.state.lock() {
            Ok(mut state) if !state.started => {
                state.started = true;
                Some(std::mem::take(&mut state.callbacks))
            }
            _ => None,
        };
        let Some(callbacks) = callbacks else {
            self.done().await;
            return;
        };

        info!(callbacks = callbacks.len(), "shutting down");
        for callback in callbacks.into_iter().rev() {
            if let Err(e) = timeout::with_timeout(SHUTDOWN_TIMEOUT_KEY, callback()).await {
                warn!("shutdown callback failed: {}", e);
                if let Ok(mut state) = self.inner.state.lock() {
                    state.first_error.get_or_insert_with(|| e.to_string());
                }
            }
        }
        self.inner.done.send_replace(true);
        debug!("shutdown complete");
    }

    /// Resolves once shutdown has completed.
    pub async fn done(&self) {
        let mut rx = self.inner.done.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// True once shutdown has begun.
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().map(|s| s.started).unwrap_or(true)
    }

    /// Why the service stopped, or `None` while it is running.
    ///
    /// This is the first callback failure if there was one, otherwise
    /// [`Error::Shutdown`].
    pub fn err(&self) -> Option<Error> {
        let state = self.inner.state.lock().ok()?;
        if !state.started {
            return None;
        }
        Some(match &state.first_error {
            Some(msg) => Error::ShutdownCallback(msg.clone()),
            None => Error::Shutdown,
        })
    }
}
