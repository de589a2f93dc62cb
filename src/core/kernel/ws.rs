use crate::core::config::SessionConfig;
use crate::core::errors::{ConnectionFailure, SessionError};
use crate::core::types::Epoch;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bound on how long `close` waits for the I/O tasks to finish.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
/// Outbound queue depth; senders wait when it is full.
const OUTBOUND_BUFFER: usize = 1024;

/// Transport-level settings, derived from [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    pub dial_timeout: Duration,
    /// `None` disables heartbeats
    pub ping_interval: Option<Duration>,
    pub pong_grace: Duration,
    pub outbound_rate_limit: Option<NonZeroU32>,
}

impl From<&SessionConfig> for TransportConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            url: config.url.clone(),
            dial_timeout: config.dial_timeout(),
            ping_interval: config.ping_interval(),
            pong_grace: config.pong_grace(),
            outbound_rate_limit: config.outbound_rate_limit.and_then(NonZeroU32::new),
        }
    }
}

/// What a transport reports to its consumer, tagged with the connection epoch.
#[derive(Debug)]
pub enum TransportEvent {
    /// A data frame, in wire order.
    Frame { epoch: Epoch, message: Message },
    /// The connection is gone. Emitted at most once per transport and never
    /// after an explicit `close`.
    Lost { epoch: Epoch, reason: SessionError },
}

struct Outbound {
    message: Message,
    ack: Option<oneshot::Sender<Result<(), SessionError>>>,
}

/// Fires the connection-lost event exactly once and stops both I/O tasks.
struct LossSignal {
    epoch: Epoch,
    fired: AtomicBool,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: watch::Sender<bool>,
}

impl LossSignal {
    fn fire(&self, reason: SessionError) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            warn!(epoch = self.epoch, "Connection lost: {}", reason);
            let _ = self.events.send(TransportEvent::Lost {
                epoch: self.epoch,
                reason,
            });
        }
        let _ = self.shutdown.send(true);
    }

    /// Suppress any later loss event; used for caller-initiated closes.
    fn silence(&self) {
        self.fired.store(true, Ordering::SeqCst);
    }
}

/// Time of the most recent inbound frame of any kind.
struct Activity(Mutex<Instant>);

impl Activity {
    fn touch(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable send path into one transport's serialized writer.
#[derive(Clone)]
pub struct TransportHandle {
    epoch: Epoch,
    outbound: mpsc::Sender<Outbound>,
}

impl TransportHandle {
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Queue a frame and wait until the writer has put it on the wire.
    ///
    /// Concurrent senders are queued, never interleaved.
    pub async fn send(&self, message: Message) -> Result<(), SessionError> {
        let (ack, done) = oneshot::channel();
        self.outbound
            .send(Outbound {
                message,
                ack: Some(ack),
            })
            .await
            .map_err(|_| SessionError::connection_lost("transport writer stopped"))?;
        done.await
            .map_err(|_| SessionError::connection_lost("transport writer stopped"))?
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

/// Owns exactly one physical WebSocket connection.
///
/// A reader task forwards data frames to the event channel and a writer task
/// owns the sink, so outbound frames are serialized through one path. The writer
/// also drives the heartbeat: after `ping_interval` without outbound traffic it
/// sends a ping, and if no inbound frame arrives within `pong_grace` of that ping
/// the connection is declared lost.
pub struct WsTransport {
    epoch: Epoch,
    url: String,
    handle: TransportHandle,
    loss: Arc<LossSignal>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl WsTransport {
    /// Dial `config.url` and start the I/O tasks for `epoch`.
    #[instrument(skip(config, events), fields(url = %config.url))]
    pub async fn connect(
        config: &TransportConfig,
        epoch: Epoch,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, SessionError> {
        let (ws_stream, _) =
            tokio::time::timeout(config.dial_timeout, connect_async(config.url.as_str()))
                .await
                .map_err(|_| {
                    SessionError::from(ConnectionFailure::Dial(format!(
                        "timed out after {:?}",
                        config.dial_timeout
                    )))
                })?
                .map_err(|e| SessionError::from(ConnectionFailure::Dial(e.to_string())))?;

        let (write, read) = ws_stream.split();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let loss = Arc::new(LossSignal {
            epoch,
            fired: AtomicBool::new(false),
            events: events.clone(),
            shutdown,
        });
        let activity = Arc::new(Activity(Mutex::new(Instant::now())));
        let limiter = config
            .outbound_rate_limit
            .map(|per_second| RateLimiter::direct(Quota::per_second(per_second)));

        let reader = tokio::spawn(read_loop(
            read,
            epoch,
            events,
            outbound_tx.clone(),
            Arc::clone(&activity),
            Arc::clone(&loss),
            shutdown_rx.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            write,
            outbound_rx,
            Heartbeat {
                interval: config.ping_interval,
                grace: config.pong_grace,
                activity,
            },
            limiter,
            Arc::clone(&loss),
            shutdown_rx,
        ));

        info!(epoch, "WebSocket connected");
        Ok(Self {
            epoch,
            url: config.url.clone(),
            handle: TransportHandle {
                epoch,
                outbound: outbound_tx,
            },
            loss,
            tasks: vec![reader, writer],
            closed: false,
        })
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    pub async fn send(&self, message: Message) -> Result<(), SessionError> {
        self.handle.send(message).await
    }

    /// Tear the connection down. Idempotent; never emits a loss event.
    #[instrument(skip(self), fields(url = %self.url, epoch = self.epoch))]
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.loss.silence();
        let _ = self.loss.shutdown.send(true);

        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                warn!("Transport task did not stop in time, aborting");
                task.abort();
            }
        }
        debug!("Transport closed");
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if !self.closed {
            self.loss.silence();
            let _ = self.loss.shutdown.send(true);
            for task in &self.tasks {
                task.abort();
            }
        }
    }
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    epoch: Epoch,
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: mpsc::Sender<Outbound>,
    activity: Arc<Activity>,
    loss: Arc<LossSignal>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = read.next() => next,
        };

        match next {
            Some(Ok(message)) => {
                activity.touch();
                match message {
                    Message::Text(_) | Message::Binary(_) => {
                        if events.send(TransportEvent::Frame { epoch, message }).is_err() {
                            debug!(epoch, "Event consumer gone, stopping reader");
                            break;
                        }
                    }
                    Message::Ping(data) => {
                        let pong = Outbound {
                            message: Message::Pong(data),
                            ack: None,
                        };
                        if let Err(e) = outbound.try_send(pong) {
                            warn!("Failed to queue pong response: {}", e);
                        }
                    }
                    Message::Close(frame) => {
                        let reason = frame.map_or_else(
                            || "closed by server".to_string(),
                            |f| format!("closed by server: {} {}", f.code, f.reason),
                        );
                        loss.fire(SessionError::connection_lost(reason));
                        break;
                    }
                    _ => trace!("Ignoring control frame"),
                }
            }
            Some(Err(e)) => {
                loss.fire(SessionError::connection_lost(format!("WebSocket error: {}", e)));
                break;
            }
            None => {
                loss.fire(SessionError::connection_lost("stream ended"));
                break;
            }
        }
    }
}

struct Heartbeat {
    interval: Option<Duration>,
    grace: Duration,
    activity: Arc<Activity>,
}

impl Heartbeat {
    fn tick_period(&self) -> Duration {
        let interval = self.interval.unwrap_or(Duration::from_secs(3600));
        (interval.min(self.grace) / 2).max(Duration::from_millis(5))
    }
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    heartbeat: Heartbeat,
    limiter: Option<DefaultDirectRateLimiter>,
    loss: Arc<LossSignal>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(heartbeat.tick_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_outbound = Instant::now();
    let mut ping_sent_at: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                let _ = write.close().await;
                break;
            }
            next = outbound.recv() => {
                let Some(Outbound { message, ack }) = next else {
                    break;
                };
                if let Some(limiter) = &limiter {
                    limiter.until_ready().await;
                }
                let result = write
                    .send(message)
                    .await
                    .map_err(|e| SessionError::connection_lost(format!("Failed to send WebSocket message: {}", e)));
                last_outbound = Instant::now();
                let failed = result.as_ref().err().cloned();
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
                if let Some(reason) = failed {
                    loss.fire(reason);
                    break;
                }
            }
            _ = ticker.tick(), if heartbeat.interval.is_some() => {
                let Some(interval) = heartbeat.interval else {
                    continue;
                };
                if let Some(sent_at) = ping_sent_at {
                    if heartbeat.activity.last() >= sent_at {
                        ping_sent_at = None;
                    } else if sent_at.elapsed() >= heartbeat.grace {
                        loss.fire(ConnectionFailure::PingTimeout(heartbeat.grace).into());
                        break;
                    }
                }
                if ping_sent_at.is_none() && last_outbound.elapsed() >= interval {
                    trace!("Sending heartbeat ping");
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        loss.fire(SessionError::connection_lost(format!("Failed to send ping: {}", e)));
                        break;
                    }
                    let now = Instant::now();
                    ping_sent_at = Some(now);
                    last_outbound = now;
                }
            }
        }
    }
}
