use std::rc::Rc;

use resbus_events::{ListenerOwner, names};
use tracing::{debug, error, info, warn};

use crate::error::LifecycleError;
use crate::manager::ResourceManager;
use crate::resource::{ResourceDescriptor, ResourceState};
use crate::runtime::ScriptRuntime;

impl ResourceManager {
    /// Start a resource, starting its dependencies first
    ///
    /// Only valid from `Stopped`. If a hard dependency is missing or fails to start the
    /// resource stays `Stopped`; if its own scripts fail to load it moves to `Error`.
    pub fn start(&self, name: &str) -> Result<(), LifecycleError> {
        let mut path = Vec::new();
        self.start_with_path(name, &mut path)
    }

    /// Stop a started resource nothing else depends on
    pub fn stop(&self, name: &str) -> Result<(), LifecycleError> {
        let state = self
            .registry
            .state(name)
            .ok_or_else(|| LifecycleError::ResourceNotFound(name.to_string()))?;
        if state != ResourceState::Started {
            return Err(LifecycleError::InvalidState {
                resource: name.to_string(),
                state,
            });
        }

        let dependants = self.registry.dependants(name);
        if !dependants.is_empty() {
            return Err(LifecycleError::HasDependants {
                resource: name.to_string(),
                dependants,
            });
        }

        info!(target: "lifecycle", "Stopping resource {}", name);

        // References die here: the bridge only serves started resources
        self.registry.set_state(name, ResourceState::Stopping);
        self.emit_lifecycle(names::RESOURCE_STOPPING, name);

        if let Some(runtime) = self.registry.take_runtime(name) {
            let result = self.run_as(name, || {
                runtime.unload(self);
                Ok(())
            });
            if let Err(e) = result {
                error!(target: "lifecycle", "Resource {} failed while unloading: {}", name, e);
            }
        }

        self.release_resource(name);
        self.registry.set_state(name, ResourceState::Stopped);
        self.emit_lifecycle(names::RESOURCE_STOPPED, name);

        info!(target: "lifecycle", "Stopped resource {}", name);
        Ok(())
    }

    pub fn restart(&self, name: &str) -> Result<(), LifecycleError> {
        self.stop(name)?;
        self.start(name)
    }

    /// Stop every started resource, dependants before their dependencies
    ///
    /// Returns how many resources were stopped.
    pub fn stop_all(&self) -> usize {
        let mut stopped = 0;

        loop {
            let snapshot = self.registry.snapshot();
            let ready: Vec<String> = snapshot
                .resources
                .iter()
                .rev()
                .filter(|r| r.state == ResourceState::Started && r.dependants.is_empty())
                .map(|r| r.name.clone())
                .collect();

            if ready.is_empty() {
                break;
            }

            let mut progressed = false;
            for name in ready {
                match self.stop(&name) {
                    Ok(()) => {
                        stopped += 1;
                        progressed = true;
                    }
                    // A listener may have stopped it or started a new dependant
                    Err(e) => debug!(target: "lifecycle", "Skipping {} during shutdown: {}", name, e),
                }
            }

            if !progressed {
                break;
            }
        }

        let left = self.registry.snapshot().started().count();
        if left > 0 {
            warn!(target: "lifecycle", "{} resource(s) still started after stop_all", left);
        }
        stopped
    }

    fn start_with_path(&self, name: &str, path: &mut Vec<String>) -> Result<(), LifecycleError> {
        if let Some(pos) = path.iter().position(|p| p == name) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(name.to_string());
            return Err(LifecycleError::CyclicDependency { cycle });
        }

        let descriptor = self
            .registry
            .descriptor(name)
            .ok_or_else(|| LifecycleError::ResourceNotFound(name.to_string()))?;

        self.expect_stopped(name)?;

        path.push(name.to_string());
        let result = self
            .start_dependencies(&descriptor, path)
            .and_then(|()| self.start_resolved(&descriptor));
        path.pop();

        result
    }

    fn start_dependencies(
        &self,
        descriptor: &ResourceDescriptor,
        path: &mut Vec<String>,
    ) -> Result<(), LifecycleError> {
        let name = &descriptor.name;

        // Refuse before starting anything when a hard dependency is not registered
        if let Some(dep) = descriptor
            .dependencies
            .iter()
            .find(|dep| self.registry.state(dep).is_none())
        {
            return Err(LifecycleError::MissingDependency {
                resource: name.clone(),
                dependency: dep.clone(),
            });
        }

        for dep in &descriptor.dependencies {
            match self.registry.state(dep) {
                None => {
                    return Err(LifecycleError::MissingDependency {
                        resource: name.clone(),
                        dependency: dep.clone(),
                    });
                }
                Some(ResourceState::Started) => {}
                Some(ResourceState::Stopped) => {
                    debug!(target: "lifecycle", "Starting {} for {}", dep, name);
                    match self.start_with_path(dep, path) {
                        Ok(()) => {}
                        Err(e @ LifecycleError::CyclicDependency { .. }) => return Err(e),
                        Err(e) => {
                            return Err(LifecycleError::DependencyFailed {
                                resource: name.clone(),
                                dependency: dep.clone(),
                                source: Box::new(e),
                            });
                        }
                    }
                }
                Some(state) => {
                    return Err(LifecycleError::DependencyFailed {
                        resource: name.clone(),
                        dependency: dep.clone(),
                        source: Box::new(LifecycleError::InvalidState {
                            resource: dep.clone(),
                            state,
                        }),
                    });
                }
            }
        }

        for dep in &descriptor.soft_dependencies {
            match self.registry.state(dep) {
                None => warn!(target: "lifecycle", "Soft dependency {} of {} is not registered", dep, name),
                Some(ResourceState::Stopped) => {
                    if let Err(e) = self.start_with_path(dep, path) {
                        warn!(target: "lifecycle", "Soft dependency {} of {} did not start: {}", dep, name, e);
                    }
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    fn start_resolved(&self, descriptor: &ResourceDescriptor) -> Result<(), LifecycleError> {
        let name = descriptor.name.as_str();

        // A dependency's listeners may have changed things while it started
        self.expect_stopped(name)?;

        self.registry.set_state(name, ResourceState::Starting);

        if self.emit_lifecycle(names::RESOURCE_STARTING, name).canceled {
            info!(target: "lifecycle", "Start of resource {} was canceled", name);
            self.registry.set_state(name, ResourceState::Stopped);
            return Err(LifecycleError::StartCanceled(name.to_string()));
        }

        let instance = self.registry.next_instance();
        let runtime: Rc<dyn ScriptRuntime> = Rc::from((descriptor.factory)(instance));
        self.registry.set_runtime(name, Some(runtime.clone()));

        for dep in &descriptor.dependencies {
            self.registry.add_dependant(dep, name);
        }

        debug!(target: "lifecycle",
            "Loading resource {} ({:?} instance {})",
            name,
            runtime.kind(),
            instance
        );

        if let Err(e) = self.run_as(name, || runtime.load(self, name)) {
            error!(target: "lifecycle", "Resource {} failed to load: {}", name, e);

            self.registry.set_runtime(name, None);
            self.release_resource(name);
            self.registry.set_state(name, ResourceState::Error);

            return Err(LifecycleError::LoadFailed {
                resource: name.to_string(),
                source: e,
            });
        }

        self.registry.set_state(name, ResourceState::Started);
        info!(target: "lifecycle", "Started resource {}", name);

        self.emit_lifecycle(names::RESOURCE_STARTED, name);
        Ok(())
    }

    fn expect_stopped(&self, name: &str) -> Result<(), LifecycleError> {
        match self.registry.state(name) {
            Some(ResourceState::Stopped) => Ok(()),
            Some(state) => Err(LifecycleError::InvalidState {
                resource: name.to_string(),
                state,
            }),
            None => Err(LifecycleError::ResourceNotFound(name.to_string())),
        }
    }

    /// Drop listeners, pending calls and dependency links held by `name`
    fn release_resource(&self, name: &str) {
        let owner = ListenerOwner::Resource(name.to_string());
        let listeners = self.dispatcher.remove_owner(&owner);
        let pending = self.pending.cancel_owner(name);
        if listeners > 0 || pending > 0 {
            debug!(target: "lifecycle",
                "Released {} listener(s) and {} pending call(s) of {}",
                listeners,
                pending,
                name
            );
        }

        if let Some(descriptor) = self.registry.descriptor(name) {
            for dep in &descriptor.dependencies {
                self.registry.remove_dependant(dep, name);
            }
        }
    }
}
