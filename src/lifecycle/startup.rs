//! Startup orchestration.
//!
//! # Responsibilities
//! - Open the rule store and build the admission controller
//! - Bind the listener (fatal on failure)
//! - Run the accept loop plus the rule-reload, sweep and persister tasks
//! - Drain in-flight connections once shutdown is triggered
//!
//! # Design Decisions
//! - Subsystems initialize in order, not concurrently
//! - The listener is bound last, so traffic only arrives once rules are loaded
//! - File I/O from background tasks runs on the blocking pool

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::schema::GatekeeperConfig;
use crate::config::{ReloadOutcome, RuleStore};
use crate::error::Result;
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::Listener;
use crate::observability::logging::SECURITY_TARGET;
use crate::proxy::ProxyServer;
use crate::resilience::timeouts::with_deadline;
use crate::security::{AdmissionController, AutoBlockEvent};

/// A fully initialized gatekeeper, bound and ready to accept.
pub struct Gatekeeper {
    config: GatekeeperConfig,
    admission: Arc<AdmissionController>,
    server: Arc<ProxyServer>,
    listener: Listener,
    events: UnboundedReceiver<AutoBlockEvent>,
    shutdown: Shutdown,
}

impl Gatekeeper {
    /// Load rules, build the admission pipeline and bind the configured address.
    pub async fn build(config: GatekeeperConfig) -> Result<Self> {
        let listener = Listener::bind(&config.listener).await?;
        Ok(Self::assemble(config, listener))
    }

    /// Same as [`Gatekeeper::build`] but serving on an already bound socket.
    pub fn with_listener(config: GatekeeperConfig, listener: TcpListener) -> Result<Self> {
        let listener = Listener::from_listener(listener, config.listener.max_connections)?;
        Ok(Self::assemble(config, listener))
    }

    fn assemble(config: GatekeeperConfig, listener: Listener) -> Self {
        let store = Arc::new(RuleStore::open(&config.rules.path));
        let (tx, events) = mpsc::unbounded_channel();
        let admission = Arc::new(AdmissionController::new(
            store,
            config.flood.clone(),
            config.tracking.clone(),
            tx,
        ));
        let server = Arc::new(ProxyServer::new(
            Arc::clone(&admission),
            &config,
            ConnectionTracker::new(),
        ));

        Self {
            config,
            admission,
            server,
            listener,
            events,
            shutdown: Shutdown::new(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle that stops [`Gatekeeper::run`] when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Serve until shutdown, then wait for in-flight connections to finish.
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            admission,
            server,
            listener,
            events,
            shutdown,
        } = self;

        tracing::info!(
            listen = %listener.local_addr()?,
            upstream = %config.upstream.address(),
            rules_file = %config.rules.path,
            max_connections = config.listener.max_connections,
            max_connections_per_ip = config.flood.max_connections_per_ip,
            "Gatekeeper listening"
        );
        check_upstream(&config).await;

        let tasks = vec![
            tokio::spawn(reload_loop(
                Arc::clone(&admission),
                config.rules.reload_interval,
                shutdown.clone(),
            )),
            tokio::spawn(sweep_loop(
                Arc::clone(&admission),
                config.tracking.cleanup_interval,
                config.tracking.stats_every,
                config.tracking.force_cleanup_threshold,
                shutdown.clone(),
            )),
            tokio::spawn(persist_loop(Arc::clone(&admission), events, shutdown.clone())),
        ];

        Arc::clone(&server).run(listener, shutdown.clone()).await;

        let tracker = server.tracker();
        tracing::info!(
            active_connections = tracker.active_count(),
            "Waiting for connections to drain"
        );
        tracker.wait_for_drain().await;

        // Covers a run that ended without an external trigger.
        shutdown.trigger();
        join_all(tasks).await;

        tracing::info!("Gatekeeper stopped gracefully");
        Ok(())
    }
}

/// Dial the upstream once so a misconfiguration shows up at startup. Failure
/// is only a warning: the upstream may come up later.
async fn check_upstream(config: &GatekeeperConfig) {
    let addr = config.upstream.address();
    match with_deadline(
        config.timeouts.connect,
        "upstream check",
        TcpStream::connect(addr.as_str()),
    )
    .await
    {
        Ok(_) => tracing::info!(upstream = %addr, "Upstream reachable"),
        Err(e) => tracing::warn!(upstream = %addr, error = %e, "Upstream not reachable yet"),
    }
}

async fn reload_loop(admission: Arc<AdmissionController>, every: Duration, shutdown: Shutdown) {
    let mut stop = shutdown.subscribe();
    if shutdown.is_triggered() {
        return;
    }

    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.recv() => break,
            _ = ticker.tick() => {
                let admission = Arc::clone(&admission);
                match tokio::task::spawn_blocking(move || admission.refresh_rules()).await {
                    Ok(ReloadOutcome::Unchanged) => {}
                    Ok(outcome) => tracing::debug!(outcome = outcome.as_str(), "Rules poll"),
                    Err(e) => tracing::error!(error = %e, "Rule reload task failed"),
                }
            }
        }
    }
    tracing::debug!("Rule reload loop stopped");
}

async fn sweep_loop(
    admission: Arc<AdmissionController>,
    every: Duration,
    stats_every: u32,
    force_threshold: usize,
    shutdown: Shutdown,
) {
    let mut stop = shutdown.subscribe();
    if shutdown.is_triggered() {
        return;
    }

    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut runs: u32 = 0;

    loop {
        tokio::select! {
            _ = stop.recv() => break,
            _ = ticker.tick() => {
                let now = Instant::now();
                let report = admission.sweep(now);
                let rate = &report.rate;

                if rate.forced {
                    tracing::warn!(
                        tracked_ips = rate.tracked_ips,
                        threshold = force_threshold,
                        removed = rate.minute_removed + rate.hour_removed,
                        evicted = rate.evicted,
                        "Force cleanup removed excess tracked IPs"
                    );
                }
                tracing::info!(
                    minute_removed = rate.minute_removed,
                    hour_removed = rate.hour_removed,
                    flood_removed = report.flood_removed,
                    expired_blocks = report.expired_blocks,
                    active_blocks = report.active_blocks,
                    "Cleanup finished"
                );
                if rate.tracked_ips > force_threshold {
                    tracing::warn!(
                        tracked_ips = rate.tracked_ips,
                        threshold = force_threshold,
                        "High IP tracking usage"
                    );
                }

                runs = runs.wrapping_add(1);
                if stats_every > 0 && runs % stats_every == 0 {
                    let stats = admission.stats(now);
                    tracing::info!(
                        target: SECURITY_TARGET,
                        tracked_ips = stats.tracked_ips,
                        active_auto_blocks = stats.active_auto_blocks,
                        expired_auto_blocks = stats.expired_auto_blocks,
                        "DDoS statistics"
                    );
                }
            }
        }
    }
    tracing::debug!("Sweep loop stopped");
}

/// Apply auto-block events to the rules file in arrival order. Events still
/// queued at shutdown are written before the task exits.
async fn persist_loop(
    admission: Arc<AdmissionController>,
    mut events: UnboundedReceiver<AutoBlockEvent>,
    shutdown: Shutdown,
) {
    let mut stop = shutdown.subscribe();
    if !shutdown.is_triggered() {
        loop {
            tokio::select! {
                _ = stop.recv() => break,
                event = events.recv() => match event {
                    Some(event) => apply(&admission, event).await,
                    None => return,
                },
            }
        }
    }

    events.close();
    while let Some(event) = events.recv().await {
        apply(&admission, event).await;
    }
    tracing::debug!("Auto-block persister stopped");
}

async fn apply(admission: &Arc<AdmissionController>, event: AutoBlockEvent) {
    let admission = Arc::clone(admission);
    match tokio::task::spawn_blocking(move || admission.apply_block_event(event)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(target: SECURITY_TARGET, ?event, error = %e, "Failed to persist auto-block")
        }
        Err(e) => tracing::error!(error = %e, "Auto-block persist task failed"),
    }
}

async fn join_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task panicked");
        }
    }
}
