use std::fmt;
use std::sync::Arc;

use crate::runtime::ScriptRuntime;

/// Lifecycle state of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Stopped,
    Starting,
    Started,
    Stopping,
    /// Load failed; the resource must be unregistered and registered again to retry
    Error,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceState::Stopped => "stopped",
            ResourceState::Starting => "starting",
            ResourceState::Started => "started",
            ResourceState::Stopping => "stopping",
            ResourceState::Error => "in error",
        };
        f.write_str(s)
    }
}

/// Creates a fresh runtime for each start; the argument is the new instance id
pub type RuntimeFactory = Arc<dyn Fn(u32) -> Box<dyn ScriptRuntime> + Send + Sync>;

/// Everything needed to register a resource
#[derive(Clone)]
pub struct ResourceDescriptor {
    pub name: String,
    /// Must be started first; a missing or failing dependency aborts the start
    pub dependencies: Vec<String>,
    /// Started first when registered; problems are only logged
    pub soft_dependencies: Vec<String>,
    pub(crate) factory: RuntimeFactory,
}

impl ResourceDescriptor {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(u32) -> Box<dyn ScriptRuntime> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            soft_dependencies: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn with_soft_dependency(mut self, name: impl Into<String>) -> Self {
        self.soft_dependencies.push(name.into());
        self
    }
}

impl fmt::Debug for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDescriptor")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("soft_dependencies", &self.soft_dependencies)
            .finish_non_exhaustive()
    }
}

/// Owned copy of a resource's registry entry, safe to hand to other threads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub name: String,
    pub state: ResourceState,
    pub dependencies: Vec<String>,
    pub soft_dependencies: Vec<String>,
    /// Started resources that declared this one as a hard dependency
    pub dependants: Vec<String>,
    pub exports: Vec<String>,
    /// Runtime instance id while a runtime exists
    pub instance: Option<u32>,
}
