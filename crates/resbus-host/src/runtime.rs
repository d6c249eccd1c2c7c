//! Script runtime abstraction
//!
//! Every resource runs inside one [`ScriptRuntime`] instance. The host never looks
//! inside a runtime's handles; it asks [`ScriptRuntime::can_invoke`] first and then
//! resolves the handle into a [`Callable`] it can run.

use std::rc::Rc;

use crate::error::ScriptError;
use crate::manager::ResourceManager;

/// Runtime flavours the host knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    /// Scripts written as Rust closures, see [`crate::native`]
    Native,
}

/// Opaque handle into a runtime's callables
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefHandle {
    /// Entry in the runtime's reference table
    Slot(u32),
    /// Named export
    Export(String),
}

/// A resolved callable: takes an encoded argument array, returns an encoded result array
pub type Callable = Rc<dyn Fn(&ResourceManager, &[u8]) -> Result<Vec<u8>, ScriptError>>;

/// What the host needs from a script environment
///
/// All methods take `&self`: script code may re-enter the host (and through it this
/// runtime) while any of them runs, so implementations keep their own state behind
/// short-lived interior borrows.
pub trait ScriptRuntime {
    fn kind(&self) -> RuntimeKind;

    fn instance_id(&self) -> u32;

    /// Run the resource's scripts; called once while the resource is starting
    fn load(&self, manager: &ResourceManager, resource: &str) -> Result<(), ScriptError>;

    /// Release everything the scripts hold; called once while the resource is stopping
    fn unload(&self, manager: &ResourceManager);

    /// Called once per host tick while the resource is started
    fn tick(&self, _manager: &ResourceManager) -> Result<(), ScriptError> {
        Ok(())
    }

    fn can_invoke(&self, handle: &RefHandle) -> bool;

    fn resolve(&self, handle: &RefHandle) -> Option<Callable>;

    /// Store a callable in the reference table and return its slot
    fn create_ref(&self, callable: Callable) -> u32;

    /// New slot for the same callable; the callable lives until every slot is released
    fn duplicate(&self, slot: u32) -> Option<u32>;

    /// Free a slot. Returns false when the slot was not live
    fn release(&self, slot: u32) -> bool;

    /// Number of live slots sharing the callable behind `slot`
    fn ref_count(&self, slot: u32) -> Option<usize>;

    fn exports(&self) -> Vec<String>;
}
