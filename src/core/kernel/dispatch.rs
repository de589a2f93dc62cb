use crate::core::errors::SessionError;
use crate::core::kernel::calls::CallRegistry;
use crate::core::kernel::codec::RpcCodec;
use crate::core::kernel::subscriptions::SubscriptionRegistry;
use crate::core::kernel::ws::TransportEvent;
use crate::core::traits::ErrorObserver;
use crate::core::types::{Epoch, InboundFrame};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Single registration point for the caller's error observer.
#[derive(Default)]
pub struct ErrorSink {
    observer: RwLock<Option<Arc<dyn ErrorObserver>>>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registered observer.
    pub fn set(&self, observer: Arc<dyn ErrorObserver>) {
        *self.observer.write().unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    pub fn clear(&self) {
        *self.observer.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Log `error` and hand it to the observer, if any. Never gates control flow.
    pub fn report(&self, error: &SessionError) {
        warn!("Session error: {}", error);
        let observer = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer.on_error(error);
        }
    }
}

/// A connection loss forwarded to the reconnector.
#[derive(Debug)]
pub struct LostConnection {
    pub epoch: Epoch,
    pub reason: SessionError,
}

/// Routes inbound frames, in wire order, to the call or subscription registry.
///
/// Performs no I/O: it only resolves calls, invokes handlers and forwards loss
/// events, so a slow handler can delay later frames but never the transport's
/// reader, which hands frames over through an unbounded channel.
pub struct Dispatcher<C: RpcCodec> {
    codec: Arc<C>,
    calls: Arc<CallRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
    errors: Arc<ErrorSink>,
    lost: mpsc::UnboundedSender<LostConnection>,
}

impl<C: RpcCodec> Dispatcher<C> {
    pub fn new(
        codec: Arc<C>,
        calls: Arc<CallRegistry>,
        subscriptions: Arc<SubscriptionRegistry>,
        errors: Arc<ErrorSink>,
        lost: mpsc::UnboundedSender<LostConnection>,
    ) -> Self {
        Self {
            codec,
            calls,
            subscriptions,
            errors,
            lost,
        }
    }

    /// Consume transport events until every transport sender is gone.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("Dispatcher stopped");
    }

    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Frame { epoch, message } => {
                let current = self.calls.epoch();
                if epoch != current {
                    debug!(epoch, current, "Dropping frame from a previous connection");
                    return;
                }
                match self.codec.decode_message(message) {
                    Ok(Some(frame)) => self.route(frame),
                    Ok(None) => trace!("Codec ignored frame"),
                    Err(e) => self.errors.report(&e),
                }
            }
            TransportEvent::Lost { epoch, reason } => {
                if self.lost.send(LostConnection { epoch, reason }).is_err() {
                    debug!(epoch, "Reconnector gone, dropping loss event");
                }
            }
        }
    }

    fn route(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Response { id, result } => {
                if !self.calls.resolve(id, result.map_err(SessionError::from)) {
                    debug!(id, "Unmatched response discarded");
                }
            }
            InboundFrame::Notification(notification) => {
                self.subscriptions.dispatch(notification);
            }
        }
    }
}
