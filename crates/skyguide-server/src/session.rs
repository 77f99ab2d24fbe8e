use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use skyguide_core::ids::{ClientId, ClientIdAllocator};
use skyguide_telemetry::MetricsRecorder;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::codec::{encode_json, Frame, FrameCodec};
use crate::dispatcher::Dispatcher;
use crate::rpc::RpcResponse;

#[derive(Debug, thiserror::Error)]
#[error("session {0} is closed")]
pub struct SessionClosed(pub ClientId);

/// One connected client.
///
/// Writes are queued on an unbounded channel drained by the connection's
/// writer, so enqueueing never blocks the caller.
pub struct ClientSession {
    id: ClientId,
    peer: Option<SocketAddr>,
    outbox: mpsc::UnboundedSender<Bytes>,
    closing: AtomicBool,
    shutdown: CancellationToken,
    in_flight: Mutex<Vec<Value>>,
}

impl ClientSession {
    pub fn new(
        id: ClientId,
        peer: Option<SocketAddr>,
        outbox: mpsc::UnboundedSender<Bytes>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            outbox,
            closing: AtomicBool::new(false),
            shutdown,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Queue one message body for delivery.
    pub fn enqueue_write(&self, frame: Bytes) -> Result<(), SessionClosed> {
        if self.is_closing() {
            return Err(SessionClosed(self.id));
        }
        self.outbox.send(frame).map_err(|_| {
            self.closing.store(true, Ordering::Release);
            SessionClosed(self.id)
        })
    }

    /// Begin teardown. Idempotent; the connection task notices and exits.
    pub fn close(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            tracing::debug!(client_id = %self.id, "closing session");
        }
        self.shutdown.cancel();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    pub(crate) fn begin_request(&self, id: &Value) {
        self.in_flight.lock().push(id.clone());
    }

    pub(crate) fn end_request(&self, id: &Value) {
        let mut in_flight = self.in_flight.lock();
        if let Some(pos) = in_flight.iter().position(|v| v == id) {
            in_flight.remove(pos);
        }
    }

    /// Ids of requests currently being handled for this client.
    pub fn in_flight(&self) -> Vec<Value> {
        self.in_flight.lock().clone()
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Result of one broadcast pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

/// Every live session, keyed by id in accept order.
///
/// The registry owns the sessions; other components hold a [`ClientId`]
/// and must tolerate a lookup miss.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<ClientId, Arc<ClientSession>>>,
    ids: ClientIdAllocator,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session with a fresh id. It is not registered yet.
    pub fn open(
        &self,
        peer: Option<SocketAddr>,
        shutdown: CancellationToken,
    ) -> (Arc<ClientSession>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(ClientSession::new(self.ids.next_id(), peer, tx, shutdown));
        (session, rx)
    }

    /// Register a session. `initial` runs under the registry lock and its
    /// frames are queued before the session becomes visible to broadcasts,
    /// so they always reach the client ahead of any event.
    pub fn insert_with<F>(&self, session: Arc<ClientSession>, initial: F)
    where
        F: FnOnce() -> Vec<Bytes>,
    {
        let mut sessions = self.sessions.lock();
        for frame in initial() {
            if session.enqueue_write(frame).is_err() {
                return;
            }
        }
        sessions.insert(session.id(), session);
    }

    #[cfg(test)]
    pub(crate) fn insert(&self, session: Arc<ClientSession>) {
        self.insert_with(session, Vec::new);
    }

    /// Unregister and close a session. A miss is not an error.
    pub fn remove(&self, id: ClientId) -> Option<Arc<ClientSession>> {
        let session = self.sessions.lock().remove(&id)?;
        session.close();
        Some(session)
    }

    /// Queue a frame for every client. Clients whose write fails are
    /// removed; the rest still receive the frame.
    pub fn broadcast(&self, frame: &Bytes) -> Delivery {
        let mut outcome = Delivery::default();
        let mut sessions = self.sessions.lock();
        sessions.retain(|id, session| match session.enqueue_write(frame.clone()) {
            Ok(()) => {
                outcome.delivered += 1;
                true
            }
            Err(_) => {
                tracing::debug!(client_id = %id, "write failed, dropping client");
                session.close();
                outcome.dropped += 1;
                false
            }
        });
        outcome
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.sessions.lock().keys().copied().collect()
    }

    /// Close and unregister every session. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.sessions.lock());
        for session in drained.values() {
            session.close();
        }
        drained.len()
    }
}

/// Drive one client connection until it closes, then unregister it.
///
/// The reader decodes frames and dispatches them inline; the writer drains
/// the session's queue to the socket. When the client stops sending, the
/// writer still flushes everything already queued before the socket closes.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    session: Arc<ClientSession>,
    mut outbox: mpsc::UnboundedReceiver<Bytes>,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    max_frame_len: usize,
    metrics: Option<Arc<MetricsRecorder>>,
) {
    let client_id = session.id();
    let (read_half, write_half) = stream.into_split();
    let mut frames = FramedRead::new(read_half, FrameCodec::new(max_frame_len));
    let mut sink = FramedWrite::new(write_half, FrameCodec::new(max_frame_len));

    let input_done = CancellationToken::new();

    let writer = async {
        loop {
            // recv is polled before input_done, so queued frames go out first
            let frame = tokio::select! {
                biased;
                _ = session.closed() => break,
                frame = outbox.recv() => frame,
                _ = input_done.cancelled() => break,
            };
            let Some(frame) = frame else { break };
            if let Err(e) = sink.send(frame).await {
                tracing::debug!(client_id = %client_id, error = %e, "socket write failed");
                break;
            }
        }
        session.close();
    };

    let reader = async {
        loop {
            let next = tokio::select! {
                biased;
                _ = session.closed() => break,
                next = frames.next() => next,
            };
            match next {
                Some(Ok(Frame::Line(line))) => {
                    let Some(reply) = dispatcher.handle_frame(&line, &session) else {
                        continue;
                    };
                    match encode_json(&reply) {
                        Ok(bytes) => {
                            if session.enqueue_write(bytes).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(client_id = %client_id, error = %e, "could not encode reply"),
                    }
                }
                Some(Ok(Frame::Oversized)) => {
                    tracing::warn!(client_id = %client_id, max_frame_len, "client request too big");
                    if let Ok(bytes) = encode_json(&RpcResponse::too_big()) {
                        if session.enqueue_write(bytes).is_err() {
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(client_id = %client_id, error = %e, "socket read failed");
                    break;
                }
                None => {
                    tracing::debug!(client_id = %client_id, peer = ?session.peer(), "client finished sending");
                    break;
                }
            }
        }
        input_done.cancel();
    };

    tokio::join!(writer, reader);

    registry.remove(client_id);
    tracing::info!(client_id = %client_id, peer = ?session.peer(), "client disconnected");
    if let Some(m) = &metrics {
        m.gauge_inc("server.clients_connected", &[], -1.0);
    }
}
