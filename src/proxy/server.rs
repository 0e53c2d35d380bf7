//! Accept loop and per-connection handling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::Instrument;

use crate::config::schema::{GatekeeperConfig, TimeoutConfig};
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{Accepted, Listener};
use crate::observability::logging::SECURITY_TARGET;
use crate::observability::metrics;
use crate::proxy::header::{read_request_head, HeaderError, HeaderLimits};
use crate::proxy::relay::relay;
use crate::proxy::ForwardError;
use crate::resilience::timeouts::with_deadline;
use crate::security::{AdmissionController, AllowReason, Rejection, Verdict};

/// Where a connection ended up. Recorded in the close log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStage {
    Accepted,
    FloodCheck,
    RejectedFlood,
    HeaderRead,
    RejectedParse,
    AdmissionCheck,
    RejectedBlocked,
    RejectedPort,
    RejectedRate,
    RejectedAutoBlocked,
    DialUpstream,
    RejectedUpstreamUnreachable,
    Forwarding,
    Closed,
}

impl ConnectionStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::FloodCheck => "flood_check",
            Self::RejectedFlood => "rejected_flood",
            Self::HeaderRead => "header_read",
            Self::RejectedParse => "rejected_parse",
            Self::AdmissionCheck => "admission_check",
            Self::RejectedBlocked => "rejected_blocked",
            Self::RejectedPort => "rejected_port",
            Self::RejectedRate => "rejected_rate",
            Self::RejectedAutoBlocked => "rejected_auto_blocked",
            Self::DialUpstream => "dial_upstream",
            Self::RejectedUpstreamUnreachable => "rejected_upstream_unreachable",
            Self::Forwarding => "forwarding",
            Self::Closed => "closed",
        }
    }

    fn for_rejection(rejection: &Rejection) -> Self {
        match rejection {
            Rejection::SynFlood { .. } | Rejection::TooManyConnections { .. } => {
                Self::RejectedFlood
            }
            Rejection::Blocked => Self::RejectedBlocked,
            Rejection::AutoBlocked { .. } | Rejection::AutoBlockTriggered { .. } => {
                Self::RejectedAutoBlocked
            }
            Rejection::PortNotAllowed { .. } => Self::RejectedPort,
            Rejection::RateLimited { .. } => Self::RejectedRate,
        }
    }
}

pub struct ProxyServer {
    admission: Arc<AdmissionController>,
    upstream: String,
    timeouts: TimeoutConfig,
    header_limits: HeaderLimits,
    tracker: ConnectionTracker,
}

impl ProxyServer {
    pub fn new(
        admission: Arc<AdmissionController>,
        config: &GatekeeperConfig,
        tracker: ConnectionTracker,
    ) -> Self {
        Self {
            admission,
            upstream: config.upstream.address(),
            timeouts: config.timeouts.clone(),
            header_limits: HeaderLimits {
                deadline: config.timeouts.header_read,
                ..HeaderLimits::default()
            },
            tracker,
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Accept until shutdown is signalled. The listener is dropped on return,
    /// so the port stops accepting before in-flight connections drain.
    pub async fn run(self: Arc<Self>, listener: Listener, shutdown: Shutdown) {
        let mut stop = shutdown.subscribe();
        if shutdown.is_triggered() {
            return;
        }

        loop {
            tokio::select! {
                _ = stop.recv() => {
                    tracing::info!("Stopping accept loop");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(Accepted::Admitted { stream, peer, permit }) => {
                        metrics::record_connection();
                        let guard = self.tracker.track();
                        let span = tracing::info_span!("connection", id = %guard.id(), peer = %peer);
                        let server = Arc::clone(&self);

                        tokio::spawn(
                            async move {
                                let _permit = permit;
                                let _guard = guard;
                                let started = Instant::now();
                                tracing::info!("Connection accepted");

                                let stage = server.handle(stream, peer).await;
                                tracing::info!(
                                    stage = stage.as_str(),
                                    duration_ms = started.elapsed().as_millis() as u64,
                                    "Connection closed"
                                );
                            }
                            .instrument(span),
                        );
                    }
                    Ok(Accepted::AtCapacity { stream, peer }) => {
                        drop(stream);
                        metrics::record_rejection("at_capacity");
                        tracing::error!(
                            peer = %peer,
                            max_connections = listener.max_connections(),
                            "Max concurrent connections reached, dropping connection"
                        );
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Accept failed");
                        // Usually fd exhaustion; give in-flight connections a moment to close.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        drop(listener);
    }

    /// Run one connection through admission and forwarding. Returns the
    /// final stage.
    pub async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) -> ConnectionStage {
        let ip = peer.ip();
        enter(ConnectionStage::Accepted);

        enter(ConnectionStage::FloodCheck);
        // Held for the whole connection; releases the per-IP slot on every exit.
        let _ip_slot = match self.admission.precheck(ip, Instant::now()) {
            Ok(slot) => slot,
            Err(rejection) => {
                rejection.log(peer);
                return ConnectionStage::RejectedFlood;
            }
        };

        enter(ConnectionStage::HeaderRead);
        let head = match read_request_head(&mut stream, &self.header_limits).await {
            Ok(head) => head,
            Err(e) => {
                log_header_error(peer, e);
                metrics::record_rejection("parse");
                return ConnectionStage::RejectedParse;
            }
        };
        tracing::debug!(port = head.port, host = ?head.host, "Request head read");

        enter(ConnectionStage::AdmissionCheck);
        match self.admission.check(ip, head.port, Instant::now()) {
            Verdict::Allow(AllowReason::Whitelisted) => {
                tracing::info!(target: SECURITY_TARGET, %ip, port = head.port, "Whitelisted IP allowed");
            }
            Verdict::Allow(AllowReason::Passed) => {
                tracing::info!(
                    target: SECURITY_TARGET,
                    %ip,
                    port = head.port,
                    upstream = %self.upstream,
                    "Connection allowed"
                );
            }
            Verdict::Reject(rejection) => {
                rejection.log(peer);
                return ConnectionStage::for_rejection(&rejection);
            }
        }

        enter(ConnectionStage::DialUpstream);
        let mut upstream = match self.dial().await {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::error!(error = %e, "Cannot connect to upstream");
                metrics::record_rejection("upstream_unreachable");
                return ConnectionStage::RejectedUpstreamUnreachable;
            }
        };
        tracing::info!(upstream = %self.upstream, "Connected to upstream");

        if let Err(e) = with_deadline(
            self.timeouts.idle,
            "replay write",
            upstream.write_all(&head.buffered),
        )
        .await
        {
            tracing::warn!(error = %ForwardError::Replay(e), "Forwarding aborted");
            return ConnectionStage::Closed;
        }

        enter(ConnectionStage::Forwarding);
        let stats = relay(
            stream,
            upstream,
            self.timeouts.idle,
            self.timeouts.max_forward,
        )
        .await;
        tracing::debug!(
            client_to_upstream = stats.client_to_upstream + head.buffered.len() as u64,
            upstream_to_client = stats.upstream_to_client,
            "Relay finished"
        );
        ConnectionStage::Closed
    }

    async fn dial(&self) -> Result<TcpStream, ForwardError> {
        let stream = with_deadline(
            self.timeouts.connect,
            "upstream connect",
            TcpStream::connect(self.upstream.as_str()),
        )
        .await
        .map_err(|source| ForwardError::Upstream {
            addr: self.upstream.clone(),
            source,
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY on upstream socket");
        }
        Ok(stream)
    }
}

fn log_header_error(peer: SocketAddr, error: HeaderError) {
    let oversized = matches!(error, HeaderError::TooLarge { .. });
    let error = ForwardError::from(error);
    if oversized {
        tracing::warn!(target: SECURITY_TARGET, ip = %peer.ip(), error = %error, "Failed to parse request");
    } else {
        tracing::info!(ip = %peer.ip(), error = %error, "Failed to parse request");
    }
}

fn enter(stage: ConnectionStage) {
    tracing::trace!(stage = stage.as_str(), "Connection stage");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleStore;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn server_with(rules_json: &str, upstream_port: u16) -> (tempfile::TempDir, ProxyServer) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, rules_json).unwrap();

        let mut config = GatekeeperConfig::default();
        config.upstream.host = "127.0.0.1".to_string();
        config.upstream.port = upstream_port;
        config.timeouts.header_read = Duration::from_millis(200);
        config.timeouts.connect = Duration::from_millis(200);
        config.timeouts.idle = Duration::from_millis(500);

        let (tx, _rx) = mpsc::unbounded_channel();
        let admission = Arc::new(AdmissionController::new(
            Arc::new(RuleStore::open(&path)),
            config.flood.clone(),
            config.tracking.clone(),
            tx,
        ));
        (dir, ProxyServer::new(admission, &config, ConnectionTracker::new()))
    }

    /// Connected (client, server-side) socket pair on loopback.
    async fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, peer)
    }

    /// Upstream that accepts and immediately closes every connection.
    async fn hang_up_upstream() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });
        port
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn rejections_map_to_stages() {
        assert_eq!(
            ConnectionStage::for_rejection(&Rejection::PortNotAllowed { port: 22 }),
            ConnectionStage::RejectedPort
        );
        assert_eq!(
            ConnectionStage::for_rejection(&Rejection::SynFlood { attempts: 11 }),
            ConnectionStage::RejectedFlood
        );
        assert_eq!(ConnectionStage::RejectedAutoBlocked.as_str(), "rejected_auto_blocked");
    }

    #[tokio::test]
    async fn disallowed_port_stops_before_dial() {
        let (_dir, server) = server_with(r#"{"allowed_ports": [80]}"#, 9);
        let (mut client, stream, peer) = socket_pair().await;
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a:22\r\n\r\n")
            .await
            .unwrap();

        assert_eq!(server.handle(stream, peer).await, ConnectionStage::RejectedPort);
    }

    #[tokio::test]
    async fn silent_client_is_a_parse_rejection() {
        let (_dir, server) = server_with("{}", 9);
        let (_client, stream, peer) = socket_pair().await;

        assert_eq!(server.handle(stream, peer).await, ConnectionStage::RejectedParse);
        assert_eq!(server.admission.active_connections_for(peer.ip()), 0);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_reported() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let (_dir, server) = server_with("{}", port);
        let (mut client, stream, peer) = socket_pair().await;
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
            .await
            .unwrap();

        assert_eq!(
            server.handle(stream, peer).await,
            ConnectionStage::RejectedUpstreamUnreachable
        );
    }

    #[tokio::test]
    async fn upstream_hanging_up_ends_closed() {
        let port = hang_up_upstream().await;
        let (_dir, server) = server_with("{}", port);
        let (mut client, stream, peer) = socket_pair().await;
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
            .await
            .unwrap();
        drop(client);

        // Whether the replay write or the relay notices first, the
        // connection is over rather than still forwarding.
        let stage = tokio::time::timeout(Duration::from_secs(5), server.handle(stream, peer))
            .await
            .unwrap();
        assert_eq!(stage, ConnectionStage::Closed);
    }

    #[tokio::test]
    async fn upstream_dial_is_logged_at_info() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let port = hang_up_upstream().await;
        let (_dir, server) = server_with("{}", port);
        let (mut client, stream, peer) = socket_pair().await;
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
            .await
            .unwrap();
        drop(client);
        server.handle(stream, peer).await;

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Connected to upstream"), "{}", output);
    }
}
