pub mod config;
pub mod logging;
pub mod net;
mod runner;
mod runner_builder;

pub use config::{ConfigLoadError, ResbusConfig};
pub use logging::{init_logging, init_logging_in};
pub use net::{IngressError, NetIngress};
pub use runner::{RunSummary, Runner};
pub use runner_builder::{BuildError, RunnerBuilder};
