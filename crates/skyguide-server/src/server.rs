use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use skyguide_core::context::{GuiderSnapshot, GuidingContext};
use skyguide_telemetry::MetricsRecorder;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broadcaster::EventBroadcaster;
use crate::codec::DEFAULT_MAX_FRAME_LEN;
use crate::dispatcher::Dispatcher;
use crate::error::ServerError;
use crate::registry::MethodRegistry;
use crate::rpc::EnvelopeHeader;
use crate::session::{self, SessionRegistry};

/// Pause after a failed accept so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_host: String,
    /// Port of instance 1. Instance n listens on `base_port + n - 1`.
    pub base_port: u16,
    /// Longest accepted request line, in bytes.
    pub max_frame_len: usize,
    /// Reported in every event's `Host` field.
    pub host_name: String,
    /// Window in which repeated `ConfigurationChange` events collapse.
    pub config_change_debounce: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".into(),
            base_port: 4400,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            host_name: local_host_name(),
            config_change_debounce: Duration::from_millis(100),
        }
    }
}

impl ServerConfig {
    pub fn port_for_instance(&self, instance: u32) -> Result<u16, ServerError> {
        if instance == 0 {
            return Err(ServerError::InvalidInstance(instance));
        }
        u32::from(self.base_port)
            .checked_add(instance - 1)
            .and_then(|port| u16::try_from(port).ok())
            .ok_or(ServerError::InvalidInstance(instance))
    }

    /// Broadcaster stamped with this config's host name, for instance 1
    /// until the server says otherwise.
    pub fn broadcaster(&self, metrics: Option<Arc<MetricsRecorder>>) -> Arc<EventBroadcaster> {
        let header = EnvelopeHeader {
            host: self.host_name.clone(),
            instance: 1,
        };
        Arc::new(
            EventBroadcaster::new(Arc::new(SessionRegistry::new()), header, self.config_change_debounce)
                .with_metrics(metrics),
        )
    }
}

/// Host name from `HOSTNAME`, then `/etc/hostname`, then `localhost`.
pub fn local_host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accept: JoinHandle<()>,
}

/// TCP event server: accepts clients, answers their requests, and pushes
/// engine events to all of them.
pub struct EventServer {
    config: ServerConfig,
    methods: MethodRegistry,
    context: Arc<dyn GuidingContext>,
    broadcaster: Arc<EventBroadcaster>,
    metrics: Option<Arc<MetricsRecorder>>,
    running: Option<Running>,
}

impl EventServer {
    pub fn new(
        config: ServerConfig,
        methods: MethodRegistry,
        context: Arc<dyn GuidingContext>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            config,
            methods,
            context,
            broadcaster,
            metrics: None,
            running: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn client_count(&self) -> usize {
        self.broadcaster.sessions().count()
    }

    /// Listen on the port assigned to `instance`.
    pub async fn start_instance(&mut self, instance: u32) -> Result<SocketAddr, ServerError> {
        let port = self.config.port_for_instance(instance)?;
        if self.running.is_none() {
            self.broadcaster.set_instance(instance);
        }
        self.start(port).await
    }

    /// Bind and begin accepting clients. Port 0 picks a free port.
    pub async fn start(&mut self, port: u16) -> Result<SocketAddr, ServerError> {
        if let Some(running) = &self.running {
            return Err(ServerError::AlreadyStarted(running.local_addr));
        }

        let listener = TcpListener::bind((self.config.bind_host.as_str(), port))
            .await
            .map_err(|e| ServerError::from_bind(port, e))?;
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let acceptor = Acceptor {
            sessions: Arc::clone(self.broadcaster.sessions()),
            broadcaster: Arc::clone(&self.broadcaster),
            dispatcher: Arc::new(
                Dispatcher::new(self.methods.clone()).with_metrics(self.metrics.clone()),
            ),
            context: Arc::clone(&self.context),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
            max_frame_len: self.config.max_frame_len,
            metrics: self.metrics.clone(),
        };
        let accept = tokio::spawn(acceptor.run(listener));

        tracing::info!(addr = %local_addr, "event server listening");
        self.running = Some(Running {
            local_addr,
            shutdown,
            tracker,
            accept,
        });
        Ok(local_addr)
    }

    /// Stop listening and close every client. Idempotent.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.shutdown.cancel();
        if let Err(e) = running.accept.await {
            tracing::warn!(error = %e, "accept loop ended abnormally");
        }
        tracing::debug!(clients = ?self.broadcaster.sessions().ids(), "closing clients");
        let closed = self.broadcaster.sessions().close_all();
        running.tracker.close();
        running.tracker.wait().await;

        tracing::info!(addr = %running.local_addr, clients = closed, "event server stopped");
    }
}

/// Everything the accept loop needs, moved into its task.
struct Acceptor {
    sessions: Arc<SessionRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    dispatcher: Arc<Dispatcher>,
    context: Arc<dyn GuidingContext>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    max_frame_len: usize,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Acceptor {
    async fn run(self, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "could not set TCP_NODELAY");
        }

        let (session, outbox) = self.sessions.open(Some(peer), self.shutdown.child_token());
        let client_id = session.id();
        // engine state lock, then registry lock: the same order the engine
        // uses when it publishes
        self.context.with_snapshot(&mut |snapshot: &GuiderSnapshot| {
            self.sessions.insert_with(Arc::clone(&session), || {
                self.broadcaster.catchup_frames(snapshot)
            });
        });
        tracing::info!(client_id = %client_id, peer = %peer, "client connected");

        if let Some(m) = &self.metrics {
            m.counter_inc("server.connections_total", &[], 1);
            m.gauge_inc("server.clients_connected", &[], 1.0);
        }

        self.tracker.spawn(session::handle_connection(
            stream,
            session,
            outbox,
            Arc::clone(&self.sessions),
            Arc::clone(&self.dispatcher),
            self.max_frame_len,
            self.metrics.clone(),
        ));
    }
}
