//! Builder pattern for Runner

use std::sync::Arc;
use tokio::sync::watch;

use resbus_events::NetSink;
use resbus_host::{RegistryError, ResourceDescriptor, ResourceManager};

use crate::config::ResbusConfig;
use crate::net::NetIngress;
use crate::runner::Runner;

/// Error during builder configuration
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("tick_interval_ms must be greater than zero")]
    ZeroTickInterval,
    #[error("autostart names '{0}', which is not a registered resource")]
    UnknownAutostart(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Builder for [`Runner`]
pub struct RunnerBuilder {
    config: ResbusConfig,
    resources: Vec<ResourceDescriptor>,
    net_sink: Option<Arc<dyn NetSink>>,
    shutdown_rx: Option<watch::Receiver<bool>>,
}

impl RunnerBuilder {
    pub fn new() -> Self {
        Self {
            config: ResbusConfig::default(),
            resources: Vec::new(),
            net_sink: None,
            shutdown_rx: None,
        }
    }

    pub fn with_config(mut self, config: ResbusConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a resource; resources are registered in the order given
    pub fn with_resource(mut self, descriptor: ResourceDescriptor) -> Self {
        self.resources.push(descriptor);
        self
    }

    pub fn with_resources(mut self, descriptors: impl IntoIterator<Item = ResourceDescriptor>) -> Self {
        self.resources.extend(descriptors);
        self
    }

    /// Where `trigger_remote` sends outbound envelopes
    pub fn with_net_sink(mut self, sink: Arc<dyn NetSink>) -> Self {
        self.net_sink = Some(sink);
        self
    }

    /// Stop the runner when this channel changes; without one the runner stops on Ctrl+C
    pub fn with_shutdown(mut self, shutdown_rx: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    /// Create the manager and register every resource
    ///
    /// Must be called on the thread that will run the tick loop.
    pub fn build(self) -> Result<Runner, BuildError> {
        if self.config.tick_interval_ms == 0 {
            return Err(BuildError::ZeroTickInterval);
        }

        let manager = ResourceManager::new(self.config.host_options());
        for descriptor in self.resources {
            manager.register(descriptor)?;
        }

        if let Some(missing) = self
            .config
            .autostart
            .iter()
            .find(|name| manager.get(name).is_none())
        {
            return Err(BuildError::UnknownAutostart(missing.clone()));
        }

        if let Some(sink) = self.net_sink {
            manager.set_net_sink(sink);
        }

        let mut net_ingress = NetIngress::new(manager.events(), self.config.net.max_envelope_size);
        if let Some(per_second) = self.config.net.peer_events_per_second {
            net_ingress = net_ingress.with_rate_limit(per_second);
        }

        Ok(Runner::new(manager, self.config, net_ingress, self.shutdown_rx))
    }
}

impl Default for RunnerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resbus_host::NativeRuntime;

    fn empty(name: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(name, NativeRuntime::factory(|_| Ok(())))
    }

    #[test]
    fn test_build_registers_in_order() {
        let runner = RunnerBuilder::new()
            .with_resource(empty("b"))
            .with_resources([empty("a"), empty("c")])
            .build()
            .unwrap();

        let names: Vec<String> = runner
            .manager()
            .snapshot()
            .resources
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_build_errors() {
        let zero = ResbusConfig {
            tick_interval_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            RunnerBuilder::new().with_config(zero).build(),
            Err(BuildError::ZeroTickInterval)
        ));

        assert!(matches!(
            RunnerBuilder::new()
                .with_resource(empty("a"))
                .with_resource(empty("a"))
                .build(),
            Err(BuildError::Registry(RegistryError::DuplicateResource(_)))
        ));

        let autostart = ResbusConfig {
            autostart: vec!["ghost".into()],
            ..Default::default()
        };
        match RunnerBuilder::new().with_config(autostart).build() {
            Err(BuildError::UnknownAutostart(name)) => assert_eq!(name, "ghost"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("build should fail"),
        }
    }
}
