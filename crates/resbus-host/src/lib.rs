/// Resource host for resbus
///
/// The [`ResourceManager`] is the one object resources, listeners and callables run
/// against. It owns the resource registry and lifecycle state machine, the event
/// dispatcher, the reference/export call bridge, the pending-call ledger and the task
/// queue, and lives on a single tick thread. Other threads talk to it through the
/// channel handles it hands out.
pub mod bridge;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod native;
pub mod pending;
pub mod registry;
pub mod resource;
pub mod runtime;
pub mod tasks;

pub use dispatcher::{DispatchOutcome, EventView, InterceptorId, SubscriptionId};
pub use error::{CallError, DispatchError, LifecycleError, RegistryError, ScriptError, TickError};
pub use manager::{DEFAULT_PENDING_TIMEOUT, HostOptions, ResourceManager, TickReport};
pub use native::{LoadContext, NativeRuntime, NativeScript, callable};
pub use pending::{PendingCompleter, ResponseHandler};
pub use registry::{RegistrySnapshot, ResourceRegistry};
pub use resource::{ResourceDescriptor, ResourceInfo, ResourceState, RuntimeFactory};
pub use runtime::{Callable, RefHandle, RuntimeKind, ScriptRuntime};
pub use tasks::{Task, TaskSender};

pub use resbus_codec::{FunctionRefId, Value, args};
pub use resbus_events::{
    ComponentRef, Event, EventSender, ListenerOwner, NetEnvelope, NetSink, NetTarget, PeerId,
    QueueError, QueueLimit, ResourceFilter, names,
};
