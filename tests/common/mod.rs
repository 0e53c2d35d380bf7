//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gatekeeper::config::GatekeeperConfig;
use gatekeeper::security::AdmissionController;
use gatekeeper::{Gatekeeper, Shutdown};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Start an echo upstream on an ephemeral port. Returns its address and the
/// number of connections it has accepted.
pub async fn start_echo_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });

    (addr, accepted)
}

pub fn write_rules(dir: &Path, json: &str) -> PathBuf {
    let path = dir.join("rules.json");
    std::fs::write(&path, json).unwrap();
    path
}

/// Defaults with short timeouts, pointed at `upstream` and `rules`.
pub fn test_config(upstream: SocketAddr, rules: &Path) -> GatekeeperConfig {
    let mut config = GatekeeperConfig::default();
    config.upstream.host = upstream.ip().to_string();
    config.upstream.port = upstream.port();
    config.rules.path = rules.display().to_string();
    config.rules.reload_interval = Duration::from_millis(50);
    config.timeouts.header_read = Duration::from_millis(500);
    config.timeouts.connect = Duration::from_secs(1);
    config.timeouts.idle = Duration::from_secs(5);
    config
}

pub struct Running {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub admission: Arc<AdmissionController>,
    pub handle: JoinHandle<gatekeeper::Result<()>>,
}

impl Running {
    /// Trigger shutdown and wait for `run` to return.
    pub async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("gatekeeper did not stop")
            .expect("gatekeeper task panicked")
            .expect("gatekeeper run failed");
    }
}

/// Start a gatekeeper on an ephemeral loopback port.
pub async fn start_gatekeeper(config: GatekeeperConfig) -> Running {
    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gatekeeper = Gatekeeper::with_listener(config, socket).unwrap();
    let addr = gatekeeper.local_addr().unwrap();
    let shutdown = gatekeeper.shutdown_handle();
    let admission = Arc::clone(gatekeeper.admission());
    let handle = tokio::spawn(gatekeeper.run());

    Running {
        addr,
        shutdown,
        admission,
        handle,
    }
}

pub fn request_for(host: &str) -> String {
    format!("GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", host)
}

/// Open a connection through the gatekeeper, send a request for `host` and
/// wait for the echo. Returns false if the gatekeeper dropped the connection.
pub async fn round_trip(addr: SocketAddr, host: &str) -> bool {
    let mut stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(_) => return false,
    };
    let request = request_for(host);
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let mut echoed = vec![0u8; request.len()];
    match tokio::time::timeout(Duration::from_secs(3), stream.read_exact(&mut echoed)).await {
        Ok(Ok(_)) => echoed == request.as_bytes(),
        _ => false,
    }
}

/// Open a forwarded connection and keep it open.
pub async fn open_forwarded(addr: SocketAddr, host: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = request_for(host);
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut echoed = vec![0u8; request.len()];
    tokio::time::timeout(Duration::from_secs(3), stream.read_exact(&mut echoed))
        .await
        .expect("no echo from upstream")
        .unwrap();
    stream
}

/// True if the peer closes `stream` without sending anything.
pub async fn closed_without_reply(stream: &mut TcpStream, within: Duration) -> bool {
    let mut buf = [0u8; 64];
    match tokio::time::timeout(within, stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        _ => false,
    }
}
