use std::cell::{Cell, RefCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::time::{Duration, Instant};

use resbus_events::{EventSender, PeerId, QueueLimit};
use tokio::sync::watch;
use tracing::{error, info};

use crate::dispatcher::{Dispatcher, EventView};
use crate::error::{RegistryError, ScriptError, TickError};
use crate::pending::{PendingCalls, PendingCompleter};
use crate::registry::{RegistrySnapshot, ResourceRegistry};
use crate::resource::{ResourceDescriptor, ResourceInfo, ResourceState};
use crate::runtime::ScriptRuntime;
use crate::tasks::{TaskQueue, TaskSender};

/// Default deadline for pending calls issued without an explicit timeout
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(30);

/// Construction options for a [`ResourceManager`]
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub queue_limit: QueueLimit,
    pub pending_timeout: Duration,
    /// Source id stamped on outbound network envelopes
    pub local_peer: PeerId,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            queue_limit: QueueLimit::Unbounded,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            local_peer: PeerId::SERVER,
        }
    }
}

/// What a single [`ResourceManager::tick`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tasks_run: usize,
    pub events_dispatched: usize,
    pub listener_errors: usize,
    pub pending_completed: usize,
    pub pending_expired: usize,
}

pub(crate) struct ExecFrame {
    resource: Option<String>,
    invoker: Option<String>,
}

/// Pops the execution frame it pushed
pub(crate) struct ExecGuard<'a> {
    stack: &'a RefCell<Vec<ExecFrame>>,
}

impl Drop for ExecGuard<'_> {
    fn drop(&mut self) {
        self.stack.borrow_mut().pop();
    }
}

/// Resets the tick flag on every exit path
struct TickGuard<'a>(&'a Cell<bool>);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// The context every resource, listener and callable runs against
///
/// Owns the registry, dispatcher, pending-call ledger and task queue. It is not
/// `Send`: create it on the thread that will call [`ResourceManager::tick`] and hand
/// other threads the channel handles ([`ResourceManager::events`],
/// [`ResourceManager::tasks`], [`ResourceManager::pending`],
/// [`ResourceManager::registry_snapshots`]).
pub struct ResourceManager {
    pub(crate) registry: ResourceRegistry,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) pending: PendingCalls,
    tasks: TaskQueue,
    exec: RefCell<Vec<ExecFrame>>,
    ticking: Cell<bool>,
    local_peer: PeerId,
}

impl ResourceManager {
    pub fn new(options: HostOptions) -> Self {
        Self {
            registry: ResourceRegistry::new(),
            dispatcher: Dispatcher::new(options.queue_limit),
            pending: PendingCalls::new(options.pending_timeout),
            tasks: TaskQueue::new(),
            exec: RefCell::new(Vec::new()),
            ticking: Cell::new(false),
            local_peer: options.local_peer,
        }
    }

    // ========================================================================
    // Handles for other threads
    // ========================================================================

    pub fn events(&self) -> EventSender {
        self.dispatcher.sender()
    }

    pub fn tasks(&self) -> TaskSender {
        self.tasks.sender()
    }

    pub fn pending(&self) -> PendingCompleter {
        self.pending.completer()
    }

    pub fn registry_snapshots(&self) -> watch::Receiver<RegistrySnapshot> {
        self.registry.subscribe()
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    // ========================================================================
    // Registry
    // ========================================================================

    pub fn register(&self, descriptor: ResourceDescriptor) -> Result<(), RegistryError> {
        self.registry.register(descriptor)
    }

    pub fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        self.registry.unregister(name)
    }

    pub fn get(&self, name: &str) -> Option<ResourceInfo> {
        self.registry.get(name)
    }

    pub fn state(&self, name: &str) -> Option<ResourceState> {
        self.registry.state(name)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    /// Visit every resource registered when the call began
    ///
    /// The visitor may register, unregister, start or stop resources. Resources
    /// unregistered before the visitor reaches them are skipped; resources registered
    /// during the walk are not visited.
    pub fn for_all<F>(&self, mut visitor: F)
    where
        F: FnMut(&ResourceManager, &ResourceInfo),
    {
        let names: Vec<String> = self
            .registry
            .snapshot()
            .resources
            .into_iter()
            .map(|r| r.name)
            .collect();

        for name in names {
            if let Some(info) = self.registry.get(&name) {
                visitor(self, &info);
            }
        }
    }

    // ========================================================================
    // Execution context
    // ========================================================================

    /// Resource whose code is running right now
    pub fn current_resource(&self) -> Option<String> {
        self.exec.borrow().last().and_then(|f| f.resource.clone())
    }

    /// Inside an export or reference call, the resource that made the call
    pub fn invoking_resource(&self) -> Option<String> {
        self.exec.borrow().last().and_then(|f| f.invoker.clone())
    }

    pub(crate) fn enter(&self, resource: Option<&str>, invoker: Option<String>) -> ExecGuard<'_> {
        self.exec.borrow_mut().push(ExecFrame {
            resource: resource.map(str::to_string),
            invoker,
        });
        ExecGuard { stack: &self.exec }
    }

    /// Run resource code with that resource as the current one, catching panics
    pub(crate) fn run_as<R>(
        &self,
        resource: &str,
        f: impl FnOnce() -> Result<R, ScriptError>,
    ) -> Result<R, ScriptError> {
        let _exec = self.enter(Some(resource), None);
        catch_unwind(AssertUnwindSafe(f))
            .unwrap_or_else(|panic| Err(ScriptError::from_panic(panic.as_ref())))
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Run one host frame
    ///
    /// In order: tasks posted from other threads, queued events (only those queued
    /// before this tick began), per-resource runtime ticks, then pending-call
    /// completions and timeouts. Must not be called from inside itself.
    pub fn tick(&self) -> Result<TickReport, TickError> {
        if self.ticking.replace(true) {
            return Err(TickError::Reentrant);
        }
        let _guard = TickGuard(&self.ticking);

        let mut report = TickReport {
            tasks_run: self.tasks.run(self),
            ..Default::default()
        };

        for event in self.dispatcher.drain() {
            let outcome = self.dispatch(&EventView::from(&event));
            report.events_dispatched += 1;
            report.listener_errors += outcome.listener_errors;
        }

        self.tick_runtimes();

        let (completed, expired) = self.deliver_pending(Instant::now());
        report.pending_completed = completed;
        report.pending_expired = expired;

        Ok(report)
    }

    pub fn is_ticking(&self) -> bool {
        self.ticking.get()
    }

    fn tick_runtimes(&self) {
        let started: Vec<(String, Rc<dyn ScriptRuntime>)> = self
            .registry
            .snapshot()
            .started()
            .filter_map(|info| {
                self.registry
                    .runtime(&info.name)
                    .map(|rt| (info.name.clone(), rt))
            })
            .collect();

        for (name, runtime) in started {
            // An earlier tick handler may have stopped it
            if self.registry.state(&name) != Some(ResourceState::Started) {
                continue;
            }
            if let Err(e) = self.run_as(&name, || runtime.tick(self)) {
                error!(target: "lifecycle", "Resource {} failed during tick: {}", name, e);
            }
        }
    }

    /// Close the event queue; producers get `QueueError::Closed` from now on
    pub fn close(&self) {
        info!(target: "events", "Closing event queue");
        self.dispatcher.close();
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(HostOptions::default())
    }
}
