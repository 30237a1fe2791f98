use async_trait::async_trait;
use libsluice::identity::PublicIdentifier;
use libsluice::messaging::{
    MessagingError, MessagingService, ProtocolHandler, ProtocolResponse, ProtocolUpdate,
};
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

struct Envelope {
    from: PublicIdentifier,
    request: ProtocolUpdate,
    reply: oneshot::Sender<ProtocolResponse>,
}

/// One side of an in-process duplex protocol link.
///
/// Implements [`MessagingService`] for the engine's outbound path; [`serve`](Self::serve) wires
/// inbound requests into a [`ProtocolHandler`] (normally the engine itself) and routes each reply
/// back through the per-request oneshot. The endpoint does no protocol work of its own.
///
/// The failure knobs (`set_handling_delay`, `drop_next_replies`) exist so tests can produce the
/// interesting interleavings: a peer that answers slowly, or a reply lost in transit.
pub struct DirectEndpoint {
    local: PublicIdentifier,
    peer: PublicIdentifier,
    outbox: mpsc::Sender<Envelope>,
    inbox: Mutex<Option<mpsc::Receiver<Envelope>>>,
    controls: Arc<Controls>,
}

#[derive(Default)]
struct Controls {
    handling_delay: Mutex<Option<Duration>>,
    drop_replies: Mutex<u32>,
    handled: Mutex<Vec<ProtocolUpdate>>,
}

/// Create a connected pair of endpoints for the two participants.
pub fn direct_pair(a: PublicIdentifier, b: PublicIdentifier) -> (DirectEndpoint, DirectEndpoint) {
    let (a_to_b, b_inbox) = mpsc::channel(16);
    let (b_to_a, a_inbox) = mpsc::channel(16);
    let a_end = DirectEndpoint {
        local: a.clone(),
        peer: b.clone(),
        outbox: a_to_b,
        inbox: Mutex::new(Some(a_inbox)),
        controls: Arc::new(Controls::default()),
    };
    let b_end = DirectEndpoint {
        local: b,
        peer: a,
        outbox: b_to_a,
        inbox: Mutex::new(Some(b_inbox)),
        controls: Arc::new(Controls::default()),
    };
    (a_end, b_end)
}

impl DirectEndpoint {
    /// Start dispatching inbound requests to `handler`. Each request is handled on its own task
    /// so a slow channel cannot head-of-line block the others.
    pub fn serve(&self, handler: Arc<dyn ProtocolHandler>) {
        let mut inbox = self
            .inbox
            .lock()
            .expect("inbox mutex is never poisoned")
            .take()
            .expect("serve may only be called once");
        let controls = Arc::clone(&self.controls);
        let local = self.local.clone();
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                let handler = Arc::clone(&handler);
                let controls = Arc::clone(&controls);
                let local = local.clone();
                tokio::spawn(async move {
                    let delay = *controls.handling_delay.lock().unwrap();
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    controls.handled.lock().unwrap().push(envelope.request.clone());
                    let response = handler.handle_protocol_update(&envelope.from, envelope.request).await;
                    {
                        let mut drops = controls.drop_replies.lock().unwrap();
                        if *drops > 0 {
                            *drops -= 1;
                            warn!("{local}: dropping reply on the floor");
                            return;
                        }
                    }
                    // The requester may have timed out already; nothing to do then.
                    let _ = envelope.reply.send(response);
                });
            }
            debug!("{local}: peer endpoint dropped, dispatcher exiting");
        });
    }

    /// Delay every inbound request by `delay` before handling it.
    pub fn set_handling_delay(&self, delay: Duration) {
        *self.controls.handling_delay.lock().unwrap() = Some(delay);
    }

    /// Swallow the next `count` replies after handling, simulating loss in transit.
    pub fn drop_next_replies(&self, count: u32) {
        *self.controls.drop_replies.lock().unwrap() = count;
    }

    /// Every request this endpoint has handled, in arrival order.
    pub fn handled_requests(&self) -> Vec<ProtocolUpdate> {
        self.controls.handled.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessagingService for DirectEndpoint {
    async fn send_protocol_update(
        &self,
        to: &PublicIdentifier,
        request: ProtocolUpdate,
        timeout: Duration,
    ) -> Result<ProtocolResponse, MessagingError> {
        if *to != self.peer {
            return Err(MessagingError::Unreachable {
                identifier: to.clone(),
                reason: "not connected to this participant".to_string(),
            });
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope { from: self.local.clone(), request, reply: reply_tx };
        self.outbox
            .send(envelope)
            .await
            .map_err(|_| MessagingError::Unreachable {
                identifier: to.clone(),
                reason: "peer endpoint is gone".to_string(),
            })?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(MessagingError::Transport("reply channel closed".to_string())),
            Err(_) => Err(MessagingError::Timeout(to.clone())),
        }
    }
}
