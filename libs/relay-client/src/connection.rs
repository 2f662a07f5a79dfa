use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore, watch};
use tokio_util::sync::CancellationToken;

use relay_api::{ConnectionState, Connector, Transport, TransportError};

use crate::backoff::Backoff;
use crate::config::BackoffConfig;
use crate::error::{ConnectionError, SessionError};

/// Upper bound of concurrent leases. `close` waits by acquiring all of them.
const MAX_LEASES: u32 = 1 << 20;

// ═══════════════════════════════════════════════════════════════
//  Lease
// ═══════════════════════════════════════════════════════════════

/// Scoped use of the managed connection. Released on drop, on every exit
/// path including panics; `close` waits until all leases are gone.
pub struct Lease {
    transport: Arc<dyn Transport>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

impl Deref for Lease {
    type Target = dyn Transport;

    fn deref(&self) -> &Self::Target {
        &*self.transport
    }
}

// ═══════════════════════════════════════════════════════════════
//  ConnectionManager
// ═══════════════════════════════════════════════════════════════

/// Owns one logical connection to a broker endpoint.
///
/// Connects lazily (or eagerly via [`connect`](Self::connect)), reconnects
/// with exponential backoff after transient failures, and publishes state
/// transitions on a watch channel. Publishers and consumers share a manager
/// through `Arc`.
pub struct ConnectionManager {
    endpoint: String,
    connector: Arc<dyn Connector>,
    backoff: BackoffConfig,
    current: RwLock<Option<Arc<dyn Transport>>>,
    /// Serializes reconnects: one task dials, the others wait for its result.
    dial: Mutex<()>,
    leases: Arc<Semaphore>,
    state_tx: watch::Sender<ConnectionState>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Create a manager without connecting. The first acquisition dials.
    pub fn new(
        endpoint: impl Into<String>,
        connector: Arc<dyn Connector>,
        backoff: BackoffConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            endpoint: endpoint.into(),
            connector,
            backoff,
            current: RwLock::new(None),
            dial: Mutex::new(()),
            leases: Arc::new(Semaphore::new(MAX_LEASES as usize)),
            state_tx,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create a manager and establish the connection before returning.
    pub async fn connect(
        endpoint: impl Into<String>,
        connector: Arc<dyn Connector>,
        backoff: BackoffConfig,
    ) -> Result<Self, ConnectionError> {
        let manager = Self::new(endpoint, connector, backoff);
        manager.ensure_connected().await?;
        Ok(manager)
    }

    /// Open a manager, run `f`, and close the manager whatever `f` returned.
    pub async fn scoped<F, Fut, T, E>(
        endpoint: impl Into<String>,
        connector: Arc<dyn Connector>,
        backoff: BackoffConfig,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Arc<ConnectionManager>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ConnectionError>,
    {
        let manager = Arc::new(Self::connect(endpoint, connector, backoff).await?);
        let result = f(manager.clone()).await;
        manager.close().await;
        result
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn backoff(&self) -> &BackoffConfig {
        &self.backoff
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Receiver of connection-state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Leases currently held.
    pub fn active_leases(&self) -> usize {
        MAX_LEASES as usize - self.leases.available_permits()
    }

    /// Acquire the connection, dialing (with backoff) if there is none.
    pub async fn acquire(&self) -> Result<Lease, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let permit = self
            .leases
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ConnectionError::Closed)?;
        let transport = self.ensure_connected().await?;
        Ok(Lease {
            transport,
            _permit: permit,
        })
    }

    /// Run `f` with the connection. The lease is released on every exit path.
    /// A transient error from `f` drops the connection so that the next
    /// acquisition reconnects.
    pub async fn with_connection<F, Fut, T>(&self, f: F) -> Result<T, SessionError>
    where
        F: FnOnce(Arc<dyn Transport>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let lease = self.acquire().await?;
        let transport = lease.transport().clone();
        match f(transport.clone()).await {
            Ok(v) => Ok(v),
            Err(e) => {
                if e.is_transient() {
                    tracing::warn!(endpoint = %self.endpoint, error = %e, "connection failed, will reconnect");
                    drop(lease);
                    self.invalidate(&transport).await;
                }
                Err(e.into())
            }
        }
    }

    /// [`with_connection`](Self::with_connection) in a loop: transient failures
    /// are retried on a fresh connection with backoff between calls. Stops on
    /// success, on a permanent error, or after `max_attempts` consecutive
    /// transient failures with [`ConnectionError::Exhausted`].
    pub async fn retrying<F, Fut, T>(&self, mut op: F) -> Result<T, SessionError>
    where
        F: FnMut(Arc<dyn Transport>) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut backoff = Backoff::new(&self.backoff);
        loop {
            match self.with_connection(&mut op).await {
                Err(SessionError::Transport(e)) if e.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::debug!(endpoint = %self.endpoint, error = %e, attempt = backoff.failures(), "retrying on a fresh connection");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.shutdown.cancelled() => return Err(ConnectionError::Closed.into()),
                        }
                    }
                    None => {
                        tracing::error!(endpoint = %self.endpoint, attempts = backoff.failures(), error = %e, "retries exhausted");
                        return Err(ConnectionError::Exhausted {
                            endpoint: self.endpoint.clone(),
                            attempts: backoff.failures(),
                            last: e,
                        }
                        .into());
                    }
                },
                other => return other,
            }
        }
    }

    /// Forget `failed` if it is still the current connection.
    pub async fn invalidate(&self, failed: &Arc<dyn Transport>) {
        let taken = {
            let mut current = self.current.write().await;
            match current.as_ref() {
                Some(t) if same_transport(t, failed) => current.take(),
                _ => None,
            }
        };
        if let Some(t) = taken {
            let _ = t.close().await;
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Close the manager: refuse new leases, wait for outstanding ones,
    /// close the transport. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let outstanding = self.active_leases();
        if outstanding > 0 {
            tracing::debug!(endpoint = %self.endpoint, outstanding, "waiting for connection leases");
        }
        if let Ok(all) = self.leases.acquire_many(MAX_LEASES).await {
            all.forget();
        }
        self.leases.close();

        let taken = self.current.write().await.take();
        if let Some(t) = taken {
            if let Err(e) = t.close().await {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "transport close failed");
            }
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(endpoint = %self.endpoint, "connection manager closed");
    }

    // ── internals ──

    fn set_state(&self, state: ConnectionState) {
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            tracing::info!(endpoint = %self.endpoint, from = %prev, to = %state, "connection state");
        }
    }

    async fn ensure_connected(&self) -> Result<Arc<dyn Transport>, ConnectionError> {
        if let Some(t) = self.current.read().await.as_ref() {
            return Ok(t.clone());
        }

        let _dial = self.dial.lock().await;
        // Another task may have connected while we waited.
        if let Some(t) = self.current.read().await.as_ref() {
            return Ok(t.clone());
        }

        self.set_state(ConnectionState::Connecting);
        let mut backoff = Backoff::new(&self.backoff);
        loop {
            if self.is_closed() {
                self.set_state(ConnectionState::Disconnected);
                return Err(ConnectionError::Closed);
            }

            match self.connector.connect(&self.endpoint).await {
                Ok(transport) => {
                    let transport: Arc<dyn Transport> = Arc::from(transport);
                    *self.current.write().await = Some(transport.clone());
                    self.set_state(ConnectionState::Connected);
                    return Ok(transport);
                }
                Err(e) if !e.is_transient() => {
                    self.set_state(ConnectionState::Disconnected);
                    tracing::error!(endpoint = %self.endpoint, error = %e, "connect rejected");
                    return Err(ConnectionError::Fatal {
                        endpoint: self.endpoint.clone(),
                        cause: e,
                    });
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(
                            endpoint = %self.endpoint,
                            attempt = backoff.failures(),
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "connect failed, retrying"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = self.shutdown.cancelled() => {
                                self.set_state(ConnectionState::Disconnected);
                                return Err(ConnectionError::Closed);
                            }
                        }
                    }
                    None => {
                        self.set_state(ConnectionState::Disconnected);
                        tracing::error!(
                            endpoint = %self.endpoint,
                            attempts = backoff.failures(),
                            error = %e,
                            "connect attempts exhausted"
                        );
                        return Err(ConnectionError::Exhausted {
                            endpoint: self.endpoint.clone(),
                            attempts: backoff.failures(),
                            last: e,
                        });
                    }
                },
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        // Dropped without close(): release the transport in the background.
        let taken = self.current.get_mut().take();
        if let (Some(t), Ok(handle)) = (taken, tokio::runtime::Handle::try_current()) {
            handle.spawn(async move {
                let _ = t.close().await;
            });
        }
    }
}

fn same_transport(a: &Arc<dyn Transport>, b: &Arc<dyn Transport>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
