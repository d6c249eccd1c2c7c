use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use resbus_events::EventSender;
use resbus_host::{
    PendingCompleter, RegistrySnapshot, ResourceManager, ResourceState, TaskSender, TickReport,
};

use crate::config::ResbusConfig;
use crate::net::NetIngress;
use crate::runner_builder::RunnerBuilder;

/// Totals for one [`Runner::run`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub tasks_run: u64,
    pub events_dispatched: u64,
    pub listener_errors: u64,
    pub pending_completed: u64,
    pub pending_expired: u64,
    /// Autostart resources that failed to start
    pub autostart_failures: usize,
    /// Resources stopped during shutdown
    pub stopped: usize,
}

impl RunSummary {
    fn record(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.tasks_run += report.tasks_run as u64;
        self.events_dispatched += report.events_dispatched as u64;
        self.listener_errors += report.listener_errors as u64;
        self.pending_completed += report.pending_completed as u64;
        self.pending_expired += report.pending_expired as u64;
    }

    fn print(&self) {
        info!(target: "runner",
            "Run complete: {} ticks | {} tasks | {} events | {} listener errors | pending {} done, {} expired | {} stopped",
            self.ticks,
            self.tasks_run,
            self.events_dispatched,
            self.listener_errors,
            self.pending_completed,
            self.pending_expired,
            self.stopped
        );
    }
}

/// Owns the [`ResourceManager`] and drives its tick loop
///
/// The runner is not `Send`; await [`Runner::run`] on the thread that built it (for
/// example directly in `main`) and use the handles for everything else.
pub struct Runner {
    manager: ResourceManager,
    config: ResbusConfig,
    net_ingress: NetIngress,
    shutdown_rx: Option<watch::Receiver<bool>>,
}

impl Runner {
    pub fn builder() -> RunnerBuilder {
        RunnerBuilder::new()
    }

    pub(crate) fn new(
        manager: ResourceManager,
        config: ResbusConfig,
        net_ingress: NetIngress,
        shutdown_rx: Option<watch::Receiver<bool>>,
    ) -> Self {
        Self {
            manager,
            config,
            net_ingress,
            shutdown_rx,
        }
    }

    /// The manager, for subscribing host components before the loop starts
    pub fn manager(&self) -> &ResourceManager {
        &self.manager
    }

    pub fn config(&self) -> &ResbusConfig {
        &self.config
    }

    pub fn events(&self) -> EventSender {
        self.manager.events()
    }

    pub fn tasks(&self) -> TaskSender {
        self.manager.tasks()
    }

    pub fn pending(&self) -> PendingCompleter {
        self.manager.pending()
    }

    pub fn net_ingress(&self) -> NetIngress {
        self.net_ingress.clone()
    }

    pub fn registry_snapshots(&self) -> watch::Receiver<RegistrySnapshot> {
        self.manager.registry_snapshots()
    }

    /// Start the autostart resources, tick until shutdown, then stop everything
    pub async fn run(mut self) -> RunSummary {
        let mut summary = RunSummary {
            autostart_failures: self.autostart(),
            ..Default::default()
        };

        let tick_interval = self.config.tick_interval();
        let mut last_tick = Instant::now();
        let mut shutdown_rx = self.shutdown_rx.take();

        info!(target: "runner", "Tick loop started ({:?} interval)", tick_interval);

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(last_tick + tick_interval) => {
                    let started = Instant::now();
                    last_tick = started;
                    self.tick(&mut summary);

                    let elapsed = started.elapsed();
                    if elapsed > tick_interval {
                        debug!(target: "runner", "Tick took {:?}, longer than the interval", elapsed);
                    }
                }
                _ = async {
                    if let Some(ref mut rx) = shutdown_rx {
                        rx.changed().await
                    } else {
                        std::future::pending().await
                    }
                } => {
                    info!(target: "runner", "Received shutdown signal");
                    break;
                }
                _ = tokio::signal::ctrl_c(), if shutdown_rx.is_none() => {
                    info!(target: "runner", "Received Ctrl+C, shutting down gracefully...");
                    break;
                }
            }
        }

        // Deliver whatever was queued before the signal, then stop resources
        self.tick(&mut summary);
        summary.stopped = self.manager.stop_all();
        self.manager.close();

        summary.print();
        summary
    }

    fn autostart(&self) -> usize {
        let mut failures = 0;
        for name in &self.config.autostart {
            match self.manager.state(name) {
                Some(ResourceState::Stopped) => {}
                // Already started as another resource's dependency
                Some(ResourceState::Started) => continue,
                Some(state) => {
                    warn!(target: "runner", "Not autostarting {}: it is {}", name, state);
                    failures += 1;
                    continue;
                }
                None => {
                    warn!(target: "runner", "Autostart resource {} is no longer registered", name);
                    failures += 1;
                    continue;
                }
            }

            if let Err(e) = self.manager.start(name) {
                error!(target: "runner", "Failed to autostart {}: {}", name, e);
                failures += 1;
            }
        }
        failures
    }

    fn tick(&self, summary: &mut RunSummary) {
        match self.manager.tick() {
            Ok(report) => summary.record(&report),
            Err(e) => error!(target: "runner", "Tick failed: {}", e),
        }
    }
}
