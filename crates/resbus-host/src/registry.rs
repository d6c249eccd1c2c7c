use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tokio::sync::watch;
use tracing::debug;

use crate::error::RegistryError;
use crate::resource::{ResourceDescriptor, ResourceInfo, ResourceState};
use crate::runtime::ScriptRuntime;

/// Point-in-time copy of every registered resource, in registration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub resources: Vec<ResourceInfo>,
}

impl RegistrySnapshot {
    pub fn get(&self, name: &str) -> Option<&ResourceInfo> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn started(&self) -> impl Iterator<Item = &ResourceInfo> {
        self.resources
            .iter()
            .filter(|r| r.state == ResourceState::Started)
    }
}

struct ResourceEntry {
    descriptor: ResourceDescriptor,
    state: ResourceState,
    dependants: Vec<String>,
    runtime: Option<Rc<dyn ScriptRuntime>>,
}

impl ResourceEntry {
    fn info(&self) -> ResourceInfo {
        ResourceInfo {
            name: self.descriptor.name.clone(),
            state: self.state,
            dependencies: self.descriptor.dependencies.clone(),
            soft_dependencies: self.descriptor.soft_dependencies.clone(),
            dependants: self.dependants.clone(),
            exports: self
                .runtime
                .as_ref()
                .map(|rt| rt.exports())
                .unwrap_or_default(),
            instance: self.runtime.as_ref().map(|rt| rt.instance_id()),
        }
    }
}

/// Owns every resource's lifecycle state
///
/// Only the tick thread touches this. Borrows of the entry list never outlive a
/// method call, and every mutation republishes a [`RegistrySnapshot`] for readers on
/// other threads.
pub struct ResourceRegistry {
    entries: RefCell<Vec<ResourceEntry>>,
    next_instance: Cell<u32>,
    snapshots: watch::Sender<RegistrySnapshot>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        let (snapshots, _) = watch::channel(RegistrySnapshot::default());
        Self {
            entries: RefCell::new(Vec::new()),
            next_instance: Cell::new(1),
            snapshots,
        }
    }

    pub fn register(&self, descriptor: ResourceDescriptor) -> Result<(), RegistryError> {
        let name = descriptor.name.clone();
        self.mutate(|entries| {
            if entries.iter().any(|e| e.descriptor.name == name) {
                return Err(RegistryError::DuplicateResource(name.clone()));
            }
            entries.push(ResourceEntry {
                descriptor,
                state: ResourceState::Stopped,
                dependants: Vec::new(),
                runtime: None,
            });
            Ok(())
        })?;

        debug!(target: "lifecycle", "Registered resource {}", name);
        Ok(())
    }

    /// Remove a stopped (or failed) resource nothing depends on
    pub fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        self.mutate(|entries| {
            let idx = entries
                .iter()
                .position(|e| e.descriptor.name == name)
                .ok_or_else(|| RegistryError::ResourceNotFound(name.to_string()))?;

            let entry = &entries[idx];
            if !matches!(entry.state, ResourceState::Stopped | ResourceState::Error) {
                return Err(RegistryError::NotStopped {
                    resource: name.to_string(),
                    state: entry.state,
                });
            }
            if !entry.dependants.is_empty() {
                return Err(RegistryError::HasDependants {
                    resource: name.to_string(),
                    dependants: entry.dependants.clone(),
                });
            }

            entries.remove(idx);
            Ok(())
        })?;

        debug!(target: "lifecycle", "Unregistered resource {}", name);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<ResourceInfo> {
        self.with_entry(name, ResourceEntry::info)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.with_entry(name, |_| ()).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            resources: self.entries.borrow().iter().map(ResourceEntry::info).collect(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistrySnapshot> {
        self.snapshots.subscribe()
    }

    pub(crate) fn state(&self, name: &str) -> Option<ResourceState> {
        self.with_entry(name, |e| e.state)
    }

    pub(crate) fn descriptor(&self, name: &str) -> Option<ResourceDescriptor> {
        self.with_entry(name, |e| e.descriptor.clone())
    }

    pub(crate) fn dependants(&self, name: &str) -> Vec<String> {
        self.with_entry(name, |e| e.dependants.clone())
            .unwrap_or_default()
    }

    pub(crate) fn runtime(&self, name: &str) -> Option<Rc<dyn ScriptRuntime>> {
        self.with_entry(name, |e| e.runtime.clone()).flatten()
    }

    pub(crate) fn set_state(&self, name: &str, state: ResourceState) {
        self.mutate_entry(name, |e| e.state = state);
    }

    pub(crate) fn set_runtime(&self, name: &str, runtime: Option<Rc<dyn ScriptRuntime>>) {
        self.mutate_entry(name, |e| e.runtime = runtime);
    }

    pub(crate) fn take_runtime(&self, name: &str) -> Option<Rc<dyn ScriptRuntime>> {
        self.mutate_entry(name, |e| e.runtime.take()).flatten()
    }

    pub(crate) fn add_dependant(&self, name: &str, dependant: &str) {
        self.mutate_entry(name, |e| {
            if !e.dependants.iter().any(|d| d == dependant) {
                e.dependants.push(dependant.to_string());
            }
        });
    }

    pub(crate) fn remove_dependant(&self, name: &str, dependant: &str) {
        self.mutate_entry(name, |e| e.dependants.retain(|d| d != dependant));
    }

    pub(crate) fn next_instance(&self) -> u32 {
        let id = self.next_instance.get();
        self.next_instance.set(id.wrapping_add(1).max(1));
        id
    }

    /// Republish after a change the registry cannot see, such as new exports
    pub(crate) fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    fn with_entry<R>(&self, name: &str, f: impl FnOnce(&ResourceEntry) -> R) -> Option<R> {
        self.entries
            .borrow()
            .iter()
            .find(|e| e.descriptor.name == name)
            .map(f)
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<ResourceEntry>) -> R) -> R {
        let result = f(&mut self.entries.borrow_mut());
        self.publish();
        result
    }

    fn mutate_entry<R>(&self, name: &str, f: impl FnOnce(&mut ResourceEntry) -> R) -> Option<R> {
        self.mutate(|entries| {
            entries
                .iter_mut()
                .find(|e| e.descriptor.name == name)
                .map(f)
        })
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeRuntime;

    fn descriptor(name: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(name, NativeRuntime::factory(|_| Ok(())))
    }

    #[test]
    fn test_register_and_get() {
        let registry = ResourceRegistry::new();
        registry.register(descriptor("a")).unwrap();
        registry.register(descriptor("b")).unwrap();

        let info = registry.get("a").unwrap();
        assert_eq!(info.state, ResourceState::Stopped);
        assert_eq!(info.instance, None);
        assert!(registry.get("missing").is_none());

        let names: Vec<_> = registry
            .snapshot()
            .resources
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_duplicate_register() {
        let registry = ResourceRegistry::new();
        registry.register(descriptor("a")).unwrap();
        assert_eq!(
            registry.register(descriptor("a")),
            Err(RegistryError::DuplicateResource("a".into()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_rules() {
        let registry = ResourceRegistry::new();
        registry.register(descriptor("a")).unwrap();

        assert_eq!(
            registry.unregister("nope"),
            Err(RegistryError::ResourceNotFound("nope".into()))
        );

        registry.set_state("a", ResourceState::Started);
        assert!(matches!(
            registry.unregister("a"),
            Err(RegistryError::NotStopped { .. })
        ));

        registry.set_state("a", ResourceState::Stopped);
        registry.add_dependant("a", "b");
        assert!(matches!(
            registry.unregister("a"),
            Err(RegistryError::HasDependants { .. })
        ));

        registry.remove_dependant("a", "b");
        registry.unregister("a").unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshots_follow_mutations() {
        let registry = ResourceRegistry::new();
        let rx = registry.subscribe();

        registry.register(descriptor("a")).unwrap();
        registry.set_state("a", ResourceState::Started);

        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.get("a").unwrap().state, ResourceState::Started);
        assert_eq!(snapshot.started().count(), 1);
    }

    #[test]
    fn test_instance_ids_are_unique() {
        let registry = ResourceRegistry::new();
        let a = registry.next_instance();
        let b = registry.next_instance();
        assert_ne!(a, b);
        assert_ne!(a, 0);
    }
}
