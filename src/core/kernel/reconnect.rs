use crate::core::config::SessionConfig;
use crate::core::errors::{ConnectionFailure, SessionError};
use crate::core::kernel::calls::{CallRegistry, CallWaiter};
use crate::core::kernel::codec::RpcCodec;
use crate::core::kernel::dispatch::{ErrorSink, LostConnection};
use crate::core::kernel::subscriptions::SubscriptionRegistry;
use crate::core::kernel::ws::{TransportConfig, TransportEvent, TransportHandle, WsTransport};
use crate::core::traits::TokenSource;
use crate::core::types::{BackoffPolicy, ConnectionState, Epoch, StateEvent};
use futures_util::future::join_all;
use serde_json::{json, Value};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Upper bound for the best-effort logout sent while closing.
const LOGOUT_TIMEOUT: Duration = Duration::from_secs(1);

/// Apply `event` to `state`.
///
/// This is the only place connection states change. `Ready` is reachable from
/// `Authenticating` alone, so a connection is never usable before login and
/// subscription replay have completed.
pub fn transition(state: ConnectionState, event: StateEvent) -> Result<ConnectionState, SessionError> {
    use ConnectionState::{Authenticating, Closed, Connecting, Disconnected, Ready, Reconnecting};
    use StateEvent::{
        Abandon, AttemptFailed, AttemptsExhausted, AuthRejected, BackoffElapsed, CloseRequested,
        ConnectRequested, ConnectionLost, LoginSucceeded, TransportConnected,
    };

    let next = match (state, event) {
        (_, CloseRequested) => Closed,
        (Disconnected, ConnectRequested) => Connecting,
        (Connecting, TransportConnected) => Authenticating,
        (Authenticating, LoginSucceeded) => Ready,
        (Authenticating, AuthRejected) => Closed,
        (Connecting | Authenticating, AttemptFailed) | (Connecting | Authenticating | Ready, ConnectionLost) => {
            Reconnecting
        }
        (Reconnecting, BackoffElapsed) => Connecting,
        (Reconnecting, Abandon) => Disconnected,
        (Reconnecting, AttemptsExhausted) => Closed,
        (state, event) => {
            return Err(SessionError::ProtocolError(format!(
                "illegal transition: {:?} in state {}",
                event, state
            )))
        }
    };
    Ok(next)
}

/// Wait schedule between reconnect attempts.
///
/// Delays never decrease while attempts keep failing, are capped at `max`, and
/// restart from `base` after `reset`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, policy: BackoffPolicy) -> Self {
        Self {
            base,
            max,
            policy,
            attempt: 0,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            config.reconnect_base_wait(),
            config.reconnect_max_wait(),
            config.backoff,
        )
    }

    /// Attempts counted since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw = match self.policy {
            BackoffPolicy::Linear => self.base.saturating_mul(attempt),
            BackoffPolicy::Exponential => self.base.saturating_mul(1_u32 << (attempt - 1).min(31)),
        };
        raw.min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay(self.attempt)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// The send path callers may use. Set only while the session is `Ready`.
#[derive(Default)]
pub struct Link {
    handle: RwLock<Option<TransportHandle>>,
}

impl Link {
    pub fn get(&self) -> Option<TransportHandle> {
        self.handle.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set(&self, handle: TransportHandle) {
        *self.handle.write().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn take(&self) -> Option<TransportHandle> {
        self.handle.write().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// State shared between the session facade and its background tasks.
pub struct Shared<C: RpcCodec> {
    pub config: Arc<SessionConfig>,
    pub codec: Arc<C>,
    pub calls: Arc<CallRegistry>,
    pub subscriptions: Arc<SubscriptionRegistry>,
    pub errors: Arc<ErrorSink>,
    pub link: Link,
}

impl<C: RpcCodec> Shared<C> {
    /// Register a call on `handle`'s epoch and put it on the wire.
    ///
    /// If encoding or sending fails the returned error is the call's only
    /// resolution; the registration is dropped with the waiter.
    pub async fn send_call(
        &self,
        handle: &TransportHandle,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<CallWaiter, SessionError> {
        let waiter = self.calls.register(handle.epoch(), method, timeout)?;
        let message = self.codec.encode_call(waiter.id(), method, params)?;
        handle.send(message).await?;
        Ok(waiter)
    }
}

/// Requests from the facade to the reconnector task.
#[derive(Debug)]
pub enum Command {
    /// `deadline` is the caller's; the attempt is abandoned when it passes.
    Connect {
        deadline: Instant,
        timeout: Duration,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// Drives the connection state machine on its own task.
///
/// Owns the live [`WsTransport`] and replaces it wholesale on every attempt.
/// Connection-scoped failures expire every pending call, are reported once to
/// the error sink and then either trigger backoff and a fresh
/// `Connecting → Authenticating → Ready` traversal or end in `Disconnected`/`Closed`.
pub struct Reconnector<C: RpcCodec> {
    shared: Arc<Shared<C>>,
    token_source: Option<Arc<dyn TokenSource>>,
    transport_config: TransportConfig,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    transport: Option<WsTransport>,
    backoff: Backoff,
}

impl<C: RpcCodec> Reconnector<C> {
    pub fn new(
        shared: Arc<Shared<C>>,
        token_source: Option<Arc<dyn TokenSource>>,
        state: watch::Sender<ConnectionState>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let transport_config = TransportConfig::from(shared.config.as_ref());
        let backoff = Backoff::from_config(&shared.config);
        Self {
            shared,
            token_source,
            transport_config,
            state,
            events,
            transport: None,
            backoff,
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn advance(&self, event: StateEvent) -> ConnectionState {
        let current = self.state();
        match transition(current, event) {
            Ok(next) => {
                if next != current {
                    info!(from = %current, to = %next, ?event, "Connection state changed");
                    self.state.send_replace(next);
                }
                next
            }
            Err(e) => {
                error!("{}", e);
                current
            }
        }
    }

    /// Serve commands and loss events until shutdown, then tear down.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut lost: mpsc::UnboundedReceiver<LostConnection>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                () = shutdown_requested(&mut shutdown) => break,
                command = commands.recv() => match command {
                    Some(Command::Connect { deadline, reply, .. })
                        if reply.is_closed() || deadline <= Instant::now() =>
                    {
                        debug!("Connect request abandoned by caller");
                    }
                    Some(Command::Connect { deadline, timeout, reply }) => {
                        let result = self.connect(deadline, timeout, &mut lost, &mut shutdown).await;
                        let _ = reply.send(result);
                    }
                    None => break,
                },
                Some(loss) = lost.recv() => self.on_lost(loss, &mut lost, &mut shutdown).await,
            }
        }
        self.shut_down().await;
    }

    #[instrument(skip(self, lost, shutdown))]
    async fn connect(
        &mut self,
        deadline: Instant,
        timeout: Duration,
        lost: &mut mpsc::UnboundedReceiver<LostConnection>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        match self.state() {
            ConnectionState::Ready => return Ok(()),
            ConnectionState::Closed => return Err(ConnectionFailure::Closed.into()),
            other if other.is_transitional() => return Err(ConnectionFailure::NotReady(other).into()),
            _ => {}
        }

        self.advance(StateEvent::ConnectRequested);
        let result = self.attempt(Some((deadline, timeout)), lost, shutdown).await;
        if let Err(e) = &result {
            match e {
                SessionError::ConnectionError(ConnectionFailure::ClosedByCaller) => {}
                SessionError::AuthError(_) if self.shared.config.auth_retry_limit.is_none() => {
                    self.advance(StateEvent::AuthRejected);
                }
                _ => {
                    self.advance(StateEvent::AttemptFailed);
                    self.advance(StateEvent::Abandon);
                }
            }
        }
        result
    }

    async fn on_lost(
        &mut self,
        loss: LostConnection,
        lost: &mut mpsc::UnboundedReceiver<LostConnection>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let current = self.transport.as_ref().map(WsTransport::epoch);
        if current != Some(loss.epoch) || !self.state().is_ready() {
            debug!(epoch = loss.epoch, ?current, "Ignoring loss of a retired connection");
            return;
        }

        self.advance(StateEvent::ConnectionLost);
        self.shared.link.take();
        self.shared.calls.expire_all(&loss.reason);
        self.shared.errors.report(&loss.reason);
        self.teardown().await;

        if !self.shared.config.auto_reconnect {
            info!("Auto-reconnect disabled, waiting for an explicit connect");
            self.advance(StateEvent::Abandon);
            return;
        }
        self.recover(lost, shutdown).await;
    }

    /// Retry with backoff until `Ready`, the attempt budget runs out, or a
    /// non-retryable auth failure.
    async fn recover(
        &mut self,
        lost: &mut mpsc::UnboundedReceiver<LostConnection>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let mut auth_failures = 0_u32;
        loop {
            if self.backoff.attempt() >= self.shared.config.max_reconnect_attempts {
                let error: SessionError = ConnectionFailure::ReconnectExhausted {
                    attempts: self.backoff.attempt(),
                }
                .into();
                self.advance(StateEvent::AttemptsExhausted);
                self.shared.calls.expire_all(&error);
                self.shared.errors.report(&error);
                return;
            }

            let delay = self.backoff.next_delay();
            info!(
                attempt = self.backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Waiting before reconnect"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown_requested(shutdown) => return,
            }
            self.advance(StateEvent::BackoffElapsed);

            match self.attempt(None, lost, shutdown).await {
                Ok(()) | Err(SessionError::ConnectionError(ConnectionFailure::ClosedByCaller)) => return,
                Err(SessionError::AuthError(_)) => {
                    auth_failures += 1;
                    let retry = self
                        .shared
                        .config
                        .auth_retry_limit
                        .is_some_and(|limit| auth_failures <= limit);
                    if !retry {
                        self.advance(StateEvent::AuthRejected);
                        return;
                    }
                    self.advance(StateEvent::AttemptFailed);
                }
                Err(_) => {
                    self.advance(StateEvent::AttemptFailed);
                }
            }
        }
    }

    /// One `Connecting → Ready` traversal on a fresh epoch and transport.
    ///
    /// Races the handshake against loss of the new connection, caller shutdown
    /// and the optional connect deadline. On failure the transport is torn down
    /// and the error reported; the caller decides the next state.
    async fn attempt(
        &mut self,
        deadline: Option<(Instant, Duration)>,
        lost: &mut mpsc::UnboundedReceiver<LostConnection>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        let epoch = self
            .shared
            .calls
            .begin_epoch(&SessionError::connection_lost("connection superseded"));

        let result = {
            let establish = self.establish(epoch);
            let bounded = async move {
                match deadline {
                    Some((at, after)) => tokio::time::timeout_at(at, establish)
                        .await
                        .unwrap_or_else(|_| {
                            Err(SessionError::TimeoutError {
                                method: "connect".to_string(),
                                after,
                            })
                        }),
                    None => establish.await,
                }
            };
            tokio::select! {
                result = bounded => result,
                reason = loss_of(epoch, lost) => Err(reason),
                () = shutdown_requested(shutdown) => Err(ConnectionFailure::ClosedByCaller.into()),
            }
        };

        match result {
            Ok(()) => {
                self.advance(StateEvent::LoginSucceeded);
                self.backoff.reset();
                info!(epoch, "Session ready");
                self.catch_up_subscriptions();
                Ok(())
            }
            Err(e) => {
                self.teardown().await;
                self.shared.calls.expire_all(&e);
                if !matches!(e, SessionError::ConnectionError(ConnectionFailure::ClosedByCaller)) {
                    self.shared.errors.report(&e);
                }
                Err(e)
            }
        }
    }

    /// Dial, authenticate, replay subscriptions and re-arm cancel-on-disconnect.
    #[instrument(skip(self), fields(url = %self.transport_config.url))]
    async fn establish(&mut self, epoch: Epoch) -> Result<(), SessionError> {
        let transport = WsTransport::connect(&self.transport_config, epoch, self.events.clone()).await?;
        let handle = transport.handle();
        self.transport = Some(transport);
        self.advance(StateEvent::TransportConnected);

        self.login(&handle).await?;
        self.replay_subscriptions(&handle).await?;
        if self.shared.config.cancel_on_disconnect {
            self.arm_cancel_on_disconnect(&handle).await?;
        }

        self.shared.link.set(handle);
        Ok(())
    }

    async fn login(&self, handle: &TransportHandle) -> Result<(), SessionError> {
        let Some(source) = &self.token_source else {
            debug!("No token source configured, skipping login");
            return Ok(());
        };

        // A fresh token for every attempt; nothing is cached here.
        let token = source.mint_token().await.map_err(|e| match e {
            SessionError::AuthError(_) => e,
            other => SessionError::AuthError(format!("token source failed: {}", other)),
        })?;

        let config = &self.shared.config;
        let waiter = self
            .shared
            .send_call(handle, &config.methods.login, &token.into_params(), config.call_timeout())
            .await?;
        match waiter.wait().await {
            Ok(_) => {
                info!(epoch = handle.epoch(), "Authenticated");
                Ok(())
            }
            Err(SessionError::ApiError { code, message, .. }) => Err(SessionError::AuthError(
                format!("login rejected: {} - {}", code, message),
            )),
            Err(e) => Err(e),
        }
    }

    /// Resend every desired subscription, one call per channel in add order.
    ///
    /// A venue rejection of a single channel is reported but keeps the
    /// connection; connection-scoped failures abort the attempt.
    async fn replay_subscriptions(&self, handle: &TransportHandle) -> Result<(), SessionError> {
        let channels = self.shared.subscriptions.claim_unsent(handle.epoch());
        if channels.is_empty() {
            return Ok(());
        }

        let config = &self.shared.config;
        let mut waiters = Vec::with_capacity(channels.len());
        for channel in &channels {
            let waiter = self
                .shared
                .send_call(
                    handle,
                    &config.methods.subscribe,
                    &config.methods.channel_params(channel),
                    config.call_timeout(),
                )
                .await?;
            waiters.push(async move { (channel, waiter.wait().await) });
        }

        for (channel, result) in join_all(waiters).await {
            match result {
                Ok(_) => debug!(channel = %channel, "Resubscribed"),
                Err(e) if e.is_connection_scoped() => return Err(e),
                Err(e) => {
                    warn!(channel = %channel, "Resubscribe failed: {}", e);
                    self.shared.errors.report(&e);
                }
            }
        }
        info!(epoch = handle.epoch(), count = channels.len(), "Replayed subscriptions");
        Ok(())
    }

    async fn arm_cancel_on_disconnect(&self, handle: &TransportHandle) -> Result<(), SessionError> {
        let config = &self.shared.config;
        let waiter = self
            .shared
            .send_call(
                handle,
                &config.methods.cancel_on_disconnect,
                &config.methods.cancel_on_disconnect_params,
                config.call_timeout(),
            )
            .await?;
        match waiter.wait().await {
            Ok(_) => {
                info!(epoch = handle.epoch(), "Cancel-on-disconnect armed");
                Ok(())
            }
            Err(e) if e.is_connection_scoped() => Err(e),
            Err(e) => {
                self.shared.errors.report(&e);
                Ok(())
            }
        }
    }

    /// Subscribe channels added while the replay was in flight.
    ///
    /// A `subscribe` racing with this sees the same epoch; whichever side
    /// claims the channel first sends it.
    fn catch_up_subscriptions(&self) {
        let Some(handle) = self.shared.link.get() else {
            return;
        };
        let missed = self.shared.subscriptions.claim_unsent(handle.epoch());
        if missed.is_empty() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let config = Arc::clone(&shared.config);
            for channel in missed {
                let params = config.methods.channel_params(&channel);
                let sent = shared
                    .send_call(&handle, &config.methods.subscribe, &params, config.call_timeout())
                    .await;
                let result = match sent {
                    Ok(waiter) => waiter.wait().await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(_) => debug!(channel = %channel, "Subscribed late channel"),
                    Err(e) => shared.errors.report(&e),
                }
            }
        });
    }

    async fn teardown(&mut self) {
        self.shared.link.take();
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }

    async fn shut_down(&mut self) {
        let was_ready = self.state().is_ready();
        self.advance(StateEvent::CloseRequested);
        let link = self.shared.link.take();
        self.shared
            .calls
            .expire_all(&ConnectionFailure::ClosedByCaller.into());

        if let (true, Some(_), Some(handle)) = (was_ready, &self.token_source, link) {
            self.logout(&handle).await;
        }
        self.teardown().await;
        info!("Session closed");
    }

    /// Fire-and-forget logout; the reply, if any, is discarded.
    async fn logout(&self, handle: &TransportHandle) {
        let config = &self.shared.config;
        let sent = tokio::time::timeout(
            LOGOUT_TIMEOUT,
            self.shared
                .send_call(handle, &config.methods.logout, &json!({}), LOGOUT_TIMEOUT),
        )
        .await;
        match sent {
            Ok(Ok(_)) => debug!("Logout sent"),
            Ok(Err(e)) => debug!("Logout failed: {}", e),
            Err(_) => debug!("Logout timed out"),
        }
    }
}

/// Resolves once shutdown was requested or the requesting side is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Resolves with the loss reason of connection `epoch`; losses of retired
/// connections are skipped.
async fn loss_of(epoch: Epoch, lost: &mut mpsc::UnboundedReceiver<LostConnection>) -> SessionError {
    loop {
        match lost.recv().await {
            Some(loss) if loss.epoch == epoch => return loss.reason,
            Some(loss) => debug!(epoch = loss.epoch, "Skipping loss of a retired connection"),
            None => return std::future::pending().await,
        }
    }
}
