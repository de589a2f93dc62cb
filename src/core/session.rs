use crate::core::config::SessionConfig;
use crate::core::errors::{ConnectionFailure, SessionError};
use crate::core::kernel::calls::CallRegistry;
use crate::core::kernel::codec::{JsonRpcCodec, RpcCodec};
use crate::core::kernel::dispatch::{Dispatcher, ErrorSink};
use crate::core::kernel::reconnect::{Command, Link, Reconnector, Shared};
use crate::core::kernel::subscriptions::SubscriptionRegistry;
use crate::core::kernel::ws::TransportHandle;
use crate::core::traits::{ErrorObserver, NotificationHandler, TokenSource};
use crate::core::types::{ConnectionState, Epoch, RequestPolicy};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

const COMMAND_BUFFER: usize = 16;

/// One logical connection to a venue, shared by any number of concurrent callers.
///
/// The session owns both registries and two background tasks: a dispatcher that
/// routes inbound frames and a reconnector that owns the transport and drives
/// the connection state machine. `Session` is `Send + Sync`; wrap it in an
/// `Arc` to issue calls from several tasks.
///
/// Must be created inside a Tokio runtime.
///
/// ```rust,no_run
/// use rpcsession::{HmacSigner, Notification, Session, SessionConfig, TokenSource};
/// use serde_json::json;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), rpcsession::SessionError> {
/// let config = SessionConfig::new("wss://test.deribit.com/ws/api/v2");
/// let signer: Arc<dyn TokenSource> =
///     Arc::new(HmacSigner::new("client_id".to_string(), "secret".to_string()));
/// let session = Session::new(config, Some(signer))?;
///
/// session.connect(Duration::from_secs(10)).await?;
/// session
///     .subscribe("book.BTC-PERPETUAL.100ms", |n: Notification| println!("{}", n.data))
///     .await?;
/// let time = session.call("public/get_time", json!({}), None).await?;
/// println!("server time: {}", time);
/// session.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Session<C: RpcCodec = JsonRpcCodec> {
    shared: Arc<Shared<C>>,
    state: watch::Receiver<ConnectionState>,
    commands: mpsc::Sender<Command>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    admission: Option<Arc<Semaphore>>,
}

impl Session<JsonRpcCodec> {
    /// Create a JSON-RPC session. Nothing is dialed until [`Session::connect`].
    pub fn new(
        config: SessionConfig,
        token_source: Option<Arc<dyn TokenSource>>,
    ) -> Result<Self, SessionError> {
        Self::with_codec(config, JsonRpcCodec, token_source)
    }
}

impl<C: RpcCodec> Session<C> {
    pub fn with_codec(
        config: SessionConfig,
        codec: C,
        token_source: Option<Arc<dyn TokenSource>>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let admission = config.max_in_flight.map(|n| Arc::new(Semaphore::new(n)));
        let shared = Arc::new(Shared {
            config: Arc::new(config),
            codec: Arc::new(codec),
            calls: Arc::new(CallRegistry::new()),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            errors: Arc::new(ErrorSink::new()),
            link: Link::default(),
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = Dispatcher::new(
            Arc::clone(&shared.codec),
            Arc::clone(&shared.calls),
            Arc::clone(&shared.subscriptions),
            Arc::clone(&shared.errors),
            lost_tx,
        );
        tokio::spawn(dispatcher.run(events_rx));

        let reconnector = Reconnector::new(Arc::clone(&shared), token_source, state_tx, events_tx);
        let supervisor = tokio::spawn(reconnector.run(commands_rx, lost_rx, shutdown_rx));

        debug!(url = %shared.config.url, "Session created");
        Ok(Self {
            shared,
            state: state_rx,
            commands: commands_tx,
            shutdown: shutdown_tx,
            supervisor: Mutex::new(Some(supervisor)),
            admission,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Epoch of the current (or most recent) connection.
    pub fn epoch(&self) -> Epoch {
        self.shared.calls.epoch()
    }

    pub fn pending_calls(&self) -> usize {
        self.shared.calls.pending_count()
    }

    /// Desired channels, in the order they will be replayed.
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.subscriptions.all_desired()
    }

    /// Register the single error observer, replacing any previous one.
    pub fn set_error_observer(&self, observer: impl ErrorObserver + 'static) {
        self.shared.errors.set(Arc::new(observer));
    }

    pub fn clear_error_observer(&self) {
        self.shared.errors.clear();
    }

    /// Drive the session from `Disconnected` to `Ready`.
    ///
    /// Succeeds immediately when already `Ready`. On failure the session falls
    /// back to `Disconnected` and the error is returned. This is a single
    /// attempt: `auth_retry_limit` only applies to reconnects, so a rejected
    /// login here returns `AuthError` and, when no retry budget is configured,
    /// closes the session.
    ///
    /// `timeout` covers the whole call, including time spent queued behind the
    /// reconnector; an attempt still running when it passes is abandoned.
    #[instrument(skip(self), fields(url = %self.shared.config.url))]
    pub async fn connect(&self, timeout: Duration) -> Result<(), SessionError> {
        match self.state() {
            ConnectionState::Ready => return Ok(()),
            ConnectionState::Closed => return Err(ConnectionFailure::Closed.into()),
            _ => {}
        }

        let deadline = Instant::now() + timeout;
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Connect {
                deadline,
                timeout,
                reply,
            })
            .await
            .map_err(|_| SessionError::from(ConnectionFailure::Closed))?;

        match tokio::time::timeout_at(deadline, done).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectionFailure::Closed.into()),
            Err(_) => Err(SessionError::TimeoutError {
                method: "connect".to_string(),
                after: timeout,
            }),
        }
    }

    /// Authentication is performed by the reconnector on every connection; this
    /// connects if needed and is a no-op once `Ready`.
    pub async fn login(&self) -> Result<(), SessionError> {
        if self.state().is_ready() {
            return Ok(());
        }
        let config = &self.shared.config;
        self.connect(config.dial_timeout() + config.call_timeout()).await
    }

    /// Issue `method` and wait for its single resolution.
    ///
    /// `timeout` defaults to the configured call timeout and bounds everything:
    /// waiting for `Ready` under [`RequestPolicy::Queue`], waiting for an
    /// admission slot, and the response itself.
    #[instrument(skip(self, params))]
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, SessionError> {
        let timeout = timeout.unwrap_or_else(|| self.shared.config.call_timeout());
        let deadline = Instant::now() + timeout;
        let timed_out = || SessionError::TimeoutError {
            method: method.to_string(),
            after: timeout,
        };

        let handle = self.ready_handle(deadline).await?.ok_or_else(timed_out)?;

        let permit = match &self.admission {
            Some(slots) => Some(
                tokio::time::timeout_at(deadline, Arc::clone(slots).acquire_owned())
                    .await
                    .map_err(|_| timed_out())?
                    .map_err(|_| SessionError::from(ConnectionFailure::Closed))?,
            ),
            None => None,
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let waiter = tokio::time::timeout_at(
            deadline,
            self.shared.send_call(&handle, method, &params, remaining),
        )
        .await
        .map_err(|_| timed_out())??;

        waiter.with_permit(permit).wait().await
    }

    /// [`Session::call`] with the result deserialized into `T`.
    pub async fn call_typed<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<T, SessionError> {
        let value = self.call(method, params, timeout).await?;
        serde_json::from_value(value).map_err(|e| {
            SessionError::ProtocolError(format!("Failed to deserialize {} result: {}", method, e))
        })
    }

    /// Make `channel` desired and route its notifications to `handler`.
    ///
    /// When `Ready` the subscribe call is sent now; otherwise the channel is
    /// sent on the next `Ready`. A venue rejection or timeout undoes the
    /// registration; a connection loss keeps it for replay.
    #[instrument(skip(self, handler))]
    pub async fn subscribe(
        &self,
        channel: &str,
        handler: impl NotificationHandler + 'static,
    ) -> Result<(), SessionError> {
        if self.state().is_closed() {
            return Err(ConnectionFailure::Closed.into());
        }
        if channel.is_empty() {
            return Err(SessionError::InvalidParameters(
                "channel name must not be empty".to_string(),
            ));
        }

        if !self.shared.subscriptions.add(channel, Arc::new(handler)) {
            debug!("Replaced handler of an existing subscription");
            return Ok(());
        }
        let Some(handle) = self.ready_link() else {
            debug!(state = %self.state(), "Subscription recorded, sent on next Ready");
            return Ok(());
        };
        if !self.shared.subscriptions.claim(channel, handle.epoch()) {
            debug!("Subscribe already sent on this connection");
            return Ok(());
        }

        let methods = &self.shared.config.methods;
        match self
            .request(&handle, &methods.subscribe, &methods.channel_params(channel))
            .await
        {
            Ok(_) => {
                info!("Subscribed");
                Ok(())
            }
            Err(e) if e.is_connection_scoped() => {
                debug!("Subscribe interrupted, replay pending: {}", e);
                Ok(())
            }
            Err(e) => {
                self.shared.subscriptions.remove(channel);
                Err(e)
            }
        }
    }

    /// Stop wanting `channel`; its handler is dropped immediately.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, channel: &str) -> Result<(), SessionError> {
        if self.state().is_closed() {
            return Err(ConnectionFailure::Closed.into());
        }
        if !self.shared.subscriptions.remove(channel) {
            debug!("Channel was not subscribed");
            return Ok(());
        }
        let Some(handle) = self.ready_link() else {
            return Ok(());
        };

        let methods = &self.shared.config.methods;
        match self
            .request(&handle, &methods.unsubscribe, &methods.channel_params(channel))
            .await
        {
            Ok(_) => {
                info!("Unsubscribed");
                Ok(())
            }
            // The next connection starts without it anyway.
            Err(e) if e.is_connection_scoped() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Close the session for good. Idempotent.
    ///
    /// Pending calls fail with [`ConnectionFailure::ClosedByCaller`] and the
    /// transport is torn down before this returns.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let mut supervisor = self.supervisor.lock().await;
        if let Some(task) = supervisor.take() {
            if let Err(e) = task.await {
                warn!("Reconnector task failed: {}", e);
            }
        }
    }

    fn ready_link(&self) -> Option<TransportHandle> {
        if self.state().is_ready() {
            self.shared.link.get()
        } else {
            None
        }
    }

    /// The live send path, honouring the request policy.
    /// `Ok(None)` means the deadline passed while queued.
    async fn ready_handle(&self, deadline: Instant) -> Result<Option<TransportHandle>, SessionError> {
        let mut state = self.state.clone();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Ready => {
                    if let Some(handle) = self.shared.link.get() {
                        return Ok(Some(handle));
                    }
                }
                ConnectionState::Closed => return Err(ConnectionFailure::Closed.into()),
                _ => {}
            }

            if self.shared.config.request_policy == RequestPolicy::FailFast {
                return Err(ConnectionFailure::NotReady(current).into());
            }
            match tokio::time::timeout_at(deadline, state.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(ConnectionFailure::Closed.into()),
                Err(_) => return Ok(None),
            }
        }
    }

    async fn request(
        &self,
        handle: &TransportHandle,
        method: &str,
        params: &Value,
    ) -> Result<Value, SessionError> {
        let waiter = self
            .shared
            .send_call(handle, method, params, self.shared.config.call_timeout())
            .await?;
        waiter.wait().await
    }
}

impl<C: RpcCodec> Drop for Session<C> {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
