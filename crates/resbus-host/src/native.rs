//! Runtime for resources whose scripts are Rust closures
//!
//! A [`NativeScript`] is run once per start with a [`LoadContext`], through which it
//! registers event handlers, exports, tick and unload hooks. Everything it registers
//! belongs to that runtime instance and is dropped when the resource stops.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::Arc;

use resbus_codec::{FunctionRefId, Value};
use resbus_events::ListenerOwner;
use tracing::{error, warn};

use crate::dispatcher::{EventView, SubscriptionId};
use crate::error::ScriptError;
use crate::manager::ResourceManager;
use crate::runtime::{Callable, RefHandle, RuntimeKind, ScriptRuntime};

/// Load function of a native resource
pub type NativeScript = Arc<dyn Fn(&mut LoadContext<'_>) -> Result<(), ScriptError> + Send + Sync>;

type TickHandler = Rc<dyn Fn(&ResourceManager) -> Result<(), ScriptError>>;
type UnloadHandler = Rc<dyn Fn(&ResourceManager)>;

/// Wrap a value-level function into a [`Callable`] that speaks the argument codec
pub fn callable<F>(f: F) -> Callable
where
    F: Fn(&ResourceManager, Vec<Value>) -> Result<Vec<Value>, ScriptError> + 'static,
{
    Rc::new(move |manager: &ResourceManager, args: &[u8]| -> Result<Vec<u8>, ScriptError> {
        let args = resbus_codec::deserialize(args)?;
        let result = f(manager, args)?;
        Ok(resbus_codec::serialize(&result)?)
    })
}

struct RefTarget {
    callable: Callable,
}

struct RefTable {
    slots: HashMap<u32, Rc<RefTarget>>,
    next_slot: u32,
}

impl RefTable {
    fn insert(&mut self, target: Rc<RefTarget>) -> u32 {
        self.next_slot = self.next_slot.wrapping_add(1).max(1);
        while self.slots.contains_key(&self.next_slot) {
            self.next_slot = self.next_slot.wrapping_add(1).max(1);
        }
        self.slots.insert(self.next_slot, target);
        self.next_slot
    }
}

impl Default for RefTable {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            next_slot: 0,
        }
    }
}

pub struct NativeRuntime {
    instance: u32,
    script: NativeScript,
    refs: RefCell<RefTable>,
    exports: RefCell<BTreeMap<String, Callable>>,
    tick_handlers: RefCell<Vec<TickHandler>>,
    unload_handlers: RefCell<Vec<UnloadHandler>>,
}

impl NativeRuntime {
    pub fn new(instance: u32, script: NativeScript) -> Self {
        Self {
            instance,
            script,
            refs: RefCell::new(RefTable::default()),
            exports: RefCell::new(BTreeMap::new()),
            tick_handlers: RefCell::new(Vec::new()),
            unload_handlers: RefCell::new(Vec::new()),
        }
    }

    /// Runtime factory for a [`crate::ResourceDescriptor`]
    pub fn factory<F>(load: F) -> impl Fn(u32) -> Box<dyn ScriptRuntime> + Send + Sync + 'static
    where
        F: Fn(&mut LoadContext<'_>) -> Result<(), ScriptError> + Send + Sync + 'static,
    {
        let script: NativeScript = Arc::new(load);
        move |instance: u32| {
            Box::new(NativeRuntime::new(instance, script.clone())) as Box<dyn ScriptRuntime>
        }
    }

    fn add_export(&self, name: &str, callable: Callable) {
        if self
            .exports
            .borrow_mut()
            .insert(name.to_string(), callable)
            .is_some()
        {
            warn!(target: "bridge", "Export {} redefined by instance {}", name, self.instance);
        }
    }
}

impl ScriptRuntime for NativeRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Native
    }

    fn instance_id(&self) -> u32 {
        self.instance
    }

    fn load(&self, manager: &ResourceManager, resource: &str) -> Result<(), ScriptError> {
        let mut ctx = LoadContext {
            manager,
            runtime: self,
            resource,
        };
        (self.script)(&mut ctx)
    }

    fn unload(&self, manager: &ResourceManager) {
        let handlers = std::mem::take(&mut *self.unload_handlers.borrow_mut());
        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(manager))) {
                let e = ScriptError::from_panic(panic.as_ref());
                error!(target: "lifecycle", "Unload handler of instance {} failed: {}", self.instance, e);
            }
        }

        self.tick_handlers.borrow_mut().clear();
        let exports = std::mem::take(&mut *self.exports.borrow_mut());
        let refs = std::mem::take(&mut *self.refs.borrow_mut());
        drop(exports);
        drop(refs);
    }

    fn tick(&self, manager: &ResourceManager) -> Result<(), ScriptError> {
        let handlers = self.tick_handlers.borrow().clone();
        let mut first_error = None;
        for handler in handlers {
            let result = catch_unwind(AssertUnwindSafe(|| handler(manager)))
                .unwrap_or_else(|panic| Err(ScriptError::from_panic(panic.as_ref())));
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn can_invoke(&self, handle: &RefHandle) -> bool {
        match handle {
            RefHandle::Slot(slot) => self.refs.borrow().slots.contains_key(slot),
            RefHandle::Export(name) => self.exports.borrow().contains_key(name),
        }
    }

    fn resolve(&self, handle: &RefHandle) -> Option<Callable> {
        match handle {
            RefHandle::Slot(slot) => self
                .refs
                .borrow()
                .slots
                .get(slot)
                .map(|t| t.callable.clone()),
            RefHandle::Export(name) => self.exports.borrow().get(name).cloned(),
        }
    }

    fn create_ref(&self, callable: Callable) -> u32 {
        self.refs
            .borrow_mut()
            .insert(Rc::new(RefTarget { callable }))
    }

    fn duplicate(&self, slot: u32) -> Option<u32> {
        let mut refs = self.refs.borrow_mut();
        let target = refs.slots.get(&slot)?.clone();
        Some(refs.insert(target))
    }

    fn release(&self, slot: u32) -> bool {
        let removed = self.refs.borrow_mut().slots.remove(&slot);
        removed.is_some()
    }

    fn ref_count(&self, slot: u32) -> Option<usize> {
        self.refs.borrow().slots.get(&slot).map(Rc::strong_count)
    }

    fn exports(&self) -> Vec<String> {
        self.exports.borrow().keys().cloned().collect()
    }
}

/// Handed to a [`NativeScript`] while its resource loads
pub struct LoadContext<'a> {
    manager: &'a ResourceManager,
    runtime: &'a NativeRuntime,
    resource: &'a str,
}

impl<'a> LoadContext<'a> {
    pub fn manager(&self) -> &'a ResourceManager {
        self.manager
    }

    pub fn resource(&self) -> &str {
        self.resource
    }

    pub fn instance(&self) -> u32 {
        self.runtime.instance
    }

    /// Listen for an event; the handler is removed when the resource stops
    pub fn on<F>(&mut self, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&ResourceManager, &EventView<'_>) -> Result<(), ScriptError> + 'static,
    {
        self.manager
            .subscribe(event, ListenerOwner::Resource(self.resource.to_string()), handler)
    }

    /// Expose a function other resources can reach with `call_export`
    pub fn export<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&ResourceManager, Vec<Value>) -> Result<Vec<Value>, ScriptError> + 'static,
    {
        self.runtime.add_export(name, callable(f));
    }

    pub fn export_raw(&mut self, name: &str, callable: Callable) {
        self.runtime.add_export(name, callable);
    }

    /// Capture a function as a reference owned by this resource
    pub fn create_ref<F>(&mut self, f: F) -> FunctionRefId
    where
        F: Fn(&ResourceManager, Vec<Value>) -> Result<Vec<Value>, ScriptError> + 'static,
    {
        let slot = self.runtime.create_ref(callable(f));
        FunctionRefId::new(self.resource, self.runtime.instance, slot)
    }

    pub fn on_tick<F>(&mut self, f: F)
    where
        F: Fn(&ResourceManager) -> Result<(), ScriptError> + 'static,
    {
        self.runtime.tick_handlers.borrow_mut().push(Rc::new(f));
    }

    pub fn on_unload<F>(&mut self, f: F)
    where
        F: Fn(&ResourceManager) + 'static,
    {
        self.runtime.unload_handlers.borrow_mut().push(Rc::new(f));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> NativeRuntime {
        NativeRuntime::new(7, Arc::new(|_: &mut LoadContext<'_>| Ok::<(), ScriptError>(())))
    }

    fn noop() -> Callable {
        callable(|_, args| Ok(args))
    }

    #[test]
    fn test_duplicate_shares_callable() {
        let rt = runtime();
        let slot = rt.create_ref(noop());
        assert_eq!(rt.ref_count(slot), Some(1));

        let dup = rt.duplicate(slot).unwrap();
        assert_ne!(dup, slot);
        assert_eq!(rt.ref_count(slot), Some(2));
        assert_eq!(rt.ref_count(dup), Some(2));

        assert!(rt.release(slot));
        assert!(!rt.can_invoke(&RefHandle::Slot(slot)));
        assert!(rt.can_invoke(&RefHandle::Slot(dup)));
        assert_eq!(rt.ref_count(dup), Some(1));

        assert!(rt.release(dup));
        assert!(!rt.release(dup));
        assert_eq!(rt.ref_count(dup), None);
    }

    #[test]
    fn test_unknown_slots() {
        let rt = runtime();
        assert!(rt.duplicate(99).is_none());
        assert!(rt.resolve(&RefHandle::Slot(99)).is_none());
        assert!(!rt.can_invoke(&RefHandle::Export("nope".into())));
    }

    #[test]
    fn test_exports_listed_in_order() {
        let rt = runtime();
        rt.add_export("zeta", noop());
        rt.add_export("alpha", noop());

        assert_eq!(rt.exports(), vec!["alpha", "zeta"]);
        assert!(rt.can_invoke(&RefHandle::Export("alpha".into())));
        assert_eq!(rt.kind(), RuntimeKind::Native);
        assert_eq!(rt.instance_id(), 7);
    }
}
