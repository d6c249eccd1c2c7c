//! Reference and export calls between resources
//!
//! A [`FunctionRefId`] names a slot in one runtime instance's reference table. Before
//! any callee code runs, the bridge checks that the owning resource is started, that
//! its current runtime is the instance the id was minted by, and that the runtime can
//! still invoke the slot. Anything else is a [`CallError::StaleReference`].
//!
//! The callable is cloned out of the runtime before it runs, so a callee may call back
//! into the bridge, including into its own resource.

use std::rc::Rc;

use resbus_codec::{FunctionRefId, Value};
use tracing::{debug, trace};

use crate::error::{CallError, ScriptError};
use crate::manager::ResourceManager;
use crate::resource::ResourceState;
use crate::runtime::{Callable, RefHandle, ScriptRuntime};

impl ResourceManager {
    /// Call a function reference with encoded arguments, returning the encoded result
    pub fn call_ref(&self, func: &FunctionRefId, args: &[u8]) -> Result<Vec<u8>, CallError> {
        let callable = self
            .live_runtime(func)
            .and_then(|rt| rt.resolve(&RefHandle::Slot(func.slot)))
            .ok_or_else(|| CallError::StaleReference(func.to_string()))?;

        trace!(target: "bridge", "Calling {}", func);
        self.invoke(&func.resource, callable, args)
    }

    /// [`ResourceManager::call_ref`] with value arguments and results
    pub fn call_ref_values(
        &self,
        func: &FunctionRefId,
        args: &[Value],
    ) -> Result<Vec<Value>, CallError> {
        let payload = resbus_codec::serialize(args)?;
        let result = self.call_ref(func, &payload)?;
        Ok(resbus_codec::deserialize(&result)?)
    }

    /// Call a named export of a started resource
    pub fn call_export(
        &self,
        resource: &str,
        export: &str,
        args: &[u8],
    ) -> Result<Vec<u8>, CallError> {
        let state = self
            .registry
            .state(resource)
            .ok_or_else(|| CallError::ResourceNotFound(resource.to_string()))?;
        if state != ResourceState::Started {
            return Err(CallError::StaleReference(format!("{}/{}", resource, export)));
        }

        let handle = RefHandle::Export(export.to_string());
        let callable = self
            .registry
            .runtime(resource)
            .filter(|rt| rt.can_invoke(&handle))
            .and_then(|rt| rt.resolve(&handle))
            .ok_or_else(|| CallError::ExportNotFound {
                resource: resource.to_string(),
                export: export.to_string(),
            })?;

        trace!(target: "bridge", "Calling export {}/{}", resource, export);
        self.invoke(resource, callable, args)
    }

    /// [`ResourceManager::call_export`] with value arguments and results
    pub fn call_export_values(
        &self,
        resource: &str,
        export: &str,
        args: &[Value],
    ) -> Result<Vec<Value>, CallError> {
        let payload = resbus_codec::serialize(args)?;
        let result = self.call_export(resource, export, &payload)?;
        Ok(resbus_codec::deserialize(&result)?)
    }

    /// Take another hold on a reference; the new id must be released separately
    pub fn duplicate_ref(&self, func: &FunctionRefId) -> Result<FunctionRefId, CallError> {
        let slot = self
            .live_runtime(func)
            .and_then(|rt| rt.duplicate(func.slot))
            .ok_or_else(|| CallError::StaleReference(func.to_string()))?;

        let dup = func.with_slot(slot);
        debug!(target: "bridge", "Duplicated {} as {}", func, dup);
        Ok(dup)
    }

    /// Drop a hold on a reference
    pub fn release_ref(&self, func: &FunctionRefId) -> Result<(), CallError> {
        let released = self
            .live_runtime(func)
            .is_some_and(|rt| rt.release(func.slot));
        if !released {
            return Err(CallError::StaleReference(func.to_string()));
        }

        debug!(target: "bridge", "Released {}", func);
        Ok(())
    }

    /// Live holds on the callable behind `func`, or `None` if it is stale
    pub fn ref_count(&self, func: &FunctionRefId) -> Option<usize> {
        self.live_runtime(func)?.ref_count(func.slot)
    }

    /// Store a callable in `resource`'s reference table
    ///
    /// Allowed while the resource is starting so load code can hand out references.
    pub fn create_ref(&self, resource: &str, callable: Callable) -> Result<FunctionRefId, CallError> {
        let state = self
            .registry
            .state(resource)
            .ok_or_else(|| CallError::ResourceNotFound(resource.to_string()))?;

        let runtime = self
            .registry
            .runtime(resource)
            .filter(|_| matches!(state, ResourceState::Starting | ResourceState::Started))
            .ok_or_else(|| CallError::StaleReference(resource.to_string()))?;

        let slot = runtime.create_ref(callable);
        Ok(FunctionRefId::new(resource, runtime.instance_id(), slot))
    }

    /// [`ResourceManager::create_ref`] for a value-level function
    pub fn create_ref_fn<F>(&self, resource: &str, f: F) -> Result<FunctionRefId, CallError>
    where
        F: Fn(&ResourceManager, Vec<Value>) -> Result<Vec<Value>, ScriptError> + 'static,
    {
        self.create_ref(resource, crate::native::callable(f))
    }

    /// Runtime that owns `func`, if the reference can still be used
    fn live_runtime(&self, func: &FunctionRefId) -> Option<Rc<dyn ScriptRuntime>> {
        if self.registry.state(&func.resource)? != ResourceState::Started {
            return None;
        }
        self.registry
            .runtime(&func.resource)
            .filter(|rt| rt.instance_id() == func.instance)
            .filter(|rt| rt.can_invoke(&RefHandle::Slot(func.slot)))
    }

    fn invoke(&self, resource: &str, callable: Callable, args: &[u8]) -> Result<Vec<u8>, CallError> {
        let invoker = self.current_resource();
        let _exec = self.enter(Some(resource), invoker);

        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callable(self, args)))
            .unwrap_or_else(|panic| Err(ScriptError::from_panic(panic.as_ref())))
            .map_err(CallError::Script)
    }
}
