//! Event dispatch
//!
//! Listeners are kept in registration order. A dispatch first asks every interceptor
//! whether the event may proceed, then snapshots the matching listeners and invokes
//! them one by one. No borrow of dispatcher state is held while a listener runs, so
//! listeners may subscribe, unsubscribe, trigger nested events, or start and stop
//! resources.

use std::cell::{Cell, RefCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::Arc;

use resbus_codec::{CodecError, DecodeError, SerializeMode, Value};
use resbus_events::{
    Event, EventQueue, EventSender, ListenerOwner, NetEnvelope, NetSink, NetTarget, PeerId,
    QueueLimit, ResourceFilter, names,
};
use tracing::{debug, error, trace};

use crate::error::{DispatchError, ScriptError};
use crate::manager::ResourceManager;

/// Handle returned by [`ResourceManager::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Handle returned by [`ResourceManager::add_interceptor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorId(u64);

/// Borrowed view of the event being dispatched
#[derive(Debug, Clone, Copy)]
pub struct EventView<'a> {
    pub name: &'a str,
    pub payload: &'a [u8],
    pub source: Option<PeerId>,
    pub target: Option<&'a ResourceFilter>,
}

impl<'a> EventView<'a> {
    pub fn new(name: &'a str, payload: &'a [u8]) -> Self {
        Self {
            name,
            payload,
            source: None,
            target: None,
        }
    }

    pub fn args(&self) -> Result<Vec<Value>, DecodeError> {
        resbus_codec::deserialize(self.payload)
    }
}

impl<'a> From<&'a Event> for EventView<'a> {
    fn from(event: &'a Event) -> Self {
        Self {
            name: &event.name,
            payload: &event.payload,
            source: event.source,
            target: event.target.as_ref(),
        }
    }
}

/// Result of one synchronous dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// At least one listener was invoked
    pub delivered: bool,
    /// A listener called [`ResourceManager::cancel_current`]
    pub canceled: bool,
    /// Listeners that returned an error or panicked
    pub listener_errors: usize,
}

type Listener = Rc<dyn Fn(&ResourceManager, &EventView<'_>) -> Result<(), ScriptError>>;
type Interceptor = Rc<dyn Fn(&EventView<'_>) -> bool>;

struct Subscription {
    id: SubscriptionId,
    event: String,
    owner: ListenerOwner,
    listener: Listener,
    alive: Rc<Cell<bool>>,
}

struct Frame {
    source: Option<PeerId>,
    canceled: bool,
}

/// Dispatcher state owned by the [`ResourceManager`]
pub(crate) struct Dispatcher {
    subscriptions: RefCell<Vec<Subscription>>,
    interceptors: RefCell<Vec<(InterceptorId, Interceptor)>>,
    next_id: Cell<u64>,
    frames: RefCell<Vec<Frame>>,
    last_canceled: Cell<bool>,
    queue: RefCell<EventQueue>,
    sender: EventSender,
    net_sink: RefCell<Option<Arc<dyn NetSink>>>,
}

impl Dispatcher {
    pub(crate) fn new(limit: QueueLimit) -> Self {
        let (queue, sender) = EventQueue::new(limit);
        Self {
            subscriptions: RefCell::new(Vec::new()),
            interceptors: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
            frames: RefCell::new(Vec::new()),
            last_canceled: Cell::new(false),
            queue: RefCell::new(queue),
            sender,
            net_sink: RefCell::new(None),
        }
    }

    pub(crate) fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub(crate) fn drain(&self) -> Vec<Event> {
        self.queue.borrow_mut().drain_all()
    }

    pub(crate) fn close(&self) {
        self.queue.borrow_mut().close();
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Drop every listener belonging to `owner`
    pub(crate) fn remove_owner(&self, owner: &ListenerOwner) -> usize {
        let removed: Vec<Subscription> = {
            let mut subs = self.subscriptions.borrow_mut();
            let (removed, kept) = std::mem::take(&mut *subs)
                .into_iter()
                .partition(|s| &s.owner == owner);
            *subs = kept;
            removed
        };

        for sub in &removed {
            sub.alive.set(false);
        }
        removed.len()
    }

    fn snapshot(&self, event: &EventView<'_>) -> Vec<(ListenerOwner, Listener, Rc<Cell<bool>>)> {
        self.subscriptions
            .borrow()
            .iter()
            .filter(|s| s.event == event.name)
            .filter(|s| event.target.is_none_or(|f| f.matches(&s.owner)))
            .map(|s| (s.owner.clone(), s.listener.clone(), s.alive.clone()))
            .collect()
    }
}

impl ResourceManager {
    /// Register a listener for `event`
    pub fn subscribe<F>(&self, event: &str, owner: ListenerOwner, listener: F) -> SubscriptionId
    where
        F: Fn(&ResourceManager, &EventView<'_>) -> Result<(), ScriptError> + 'static,
    {
        let id = SubscriptionId(self.dispatcher.next_id());
        trace!(target: "events", "{} subscribed to {}", owner, event);

        self.dispatcher.subscriptions.borrow_mut().push(Subscription {
            id,
            event: event.to_string(),
            owner,
            listener: Rc::new(listener),
            alive: Rc::new(Cell::new(true)),
        });
        id
    }

    /// Remove a listener. Returns false if it was already gone
    ///
    /// Safe to call mid-dispatch: the listener is skipped if the dispatch has not
    /// reached it yet.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut subs = self.dispatcher.subscriptions.borrow_mut();
            subs.iter()
                .position(|s| s.id == id)
                .map(|idx| subs.remove(idx))
        };

        match removed {
            Some(sub) => {
                sub.alive.set(false);
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.dispatcher
            .subscriptions
            .borrow()
            .iter()
            .filter(|s| s.event == event)
            .count()
    }

    /// Run every matching listener now, on this thread
    pub fn trigger_sync(
        &self,
        name: &str,
        payload: &[u8],
        source: Option<PeerId>,
        filter: Option<&ResourceFilter>,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.check_reserved(name)?;
        Ok(self.dispatch(&EventView {
            name,
            payload,
            source,
            target: filter,
        }))
    }

    /// Serialize `args` and trigger an untargeted local event
    pub fn trigger(&self, name: &str, args: &[Value]) -> Result<DispatchOutcome, DispatchError> {
        let payload = resbus_codec::serialize(args).map_err(CodecError::from)?;
        self.trigger_sync(name, &payload, None, None)
    }

    /// Queue an event for the next tick
    pub fn queue_async(
        &self,
        name: &str,
        payload: Vec<u8>,
        source: Option<PeerId>,
        filter: Option<ResourceFilter>,
    ) -> Result<(), DispatchError> {
        self.check_reserved(name)?;

        let mut event = Event::new(name, payload);
        event.source = source;
        event.target = filter;
        self.dispatcher.sender.queue(event)?;
        Ok(())
    }

    /// Mark the innermost in-flight dispatch as canceled
    pub fn cancel_current(&self) -> Result<(), DispatchError> {
        match self.dispatcher.frames.borrow_mut().last_mut() {
            Some(frame) => {
                frame.canceled = true;
                Ok(())
            }
            None => Err(DispatchError::NoActiveDispatch),
        }
    }

    /// Whether the current dispatch has been canceled so far, or outside of a dispatch,
    /// whether the last completed one was
    pub fn was_event_canceled(&self) -> bool {
        match self.dispatcher.frames.borrow().last() {
            Some(frame) => frame.canceled,
            None => self.dispatcher.last_canceled.get(),
        }
    }

    /// Peer that sent the event being dispatched, if it came from the network
    pub fn source(&self) -> Option<PeerId> {
        self.dispatcher.frames.borrow().last().and_then(|f| f.source)
    }

    /// Install a hook that sees every dispatch first; returning false suppresses it
    pub fn add_interceptor<F>(&self, interceptor: F) -> InterceptorId
    where
        F: Fn(&EventView<'_>) -> bool + 'static,
    {
        let id = InterceptorId(self.dispatcher.next_id());
        self.dispatcher
            .interceptors
            .borrow_mut()
            .push((id, Rc::new(interceptor)));
        id
    }

    pub fn remove_interceptor(&self, id: InterceptorId) -> bool {
        let mut interceptors = self.dispatcher.interceptors.borrow_mut();
        let before = interceptors.len();
        interceptors.retain(|(i, _)| *i != id);
        interceptors.len() != before
    }

    pub fn set_net_sink(&self, sink: Arc<dyn NetSink>) {
        *self.dispatcher.net_sink.borrow_mut() = Some(sink);
    }

    /// Send an event to a remote peer, the server, or everyone
    ///
    /// The payload must not contain function references.
    pub fn trigger_remote(
        &self,
        name: &str,
        payload: &[u8],
        target: NetTarget,
    ) -> Result<(), DispatchError> {
        self.check_reserved(name)?;
        resbus_codec::check_wire_safe(payload)?;

        let sink = self
            .dispatcher
            .net_sink
            .borrow()
            .clone()
            .ok_or(DispatchError::NoNetSink)?;

        let envelope = NetEnvelope::new(self.local_peer(), name, payload.to_vec());
        envelope.validate()?;

        debug!(target: "net", "Sending {} to {:?}", name, target);
        sink.send(target, envelope);
        Ok(())
    }

    /// Serialize `args` for the network and send them
    pub fn trigger_remote_args(
        &self,
        name: &str,
        args: &[Value],
        target: NetTarget,
    ) -> Result<(), DispatchError> {
        let payload = resbus_codec::serialize_with(args, SerializeMode::Network)
            .map_err(CodecError::from)?;
        self.trigger_remote(name, &payload, target)
    }

    fn check_reserved(&self, name: &str) -> Result<(), DispatchError> {
        if names::is_reserved(name) && self.current_resource().is_some() {
            return Err(DispatchError::ReservedName(name.to_string()));
        }
        Ok(())
    }

    /// Emit one of the lifecycle events for `resource`
    pub(crate) fn emit_lifecycle(&self, name: &str, resource: &str) -> DispatchOutcome {
        let payload = match resbus_codec::serialize(&[Value::from(resource)]) {
            Ok(payload) => payload,
            Err(e) => {
                error!(target: "events", "Could not encode {} for {}: {}", name, resource, e);
                return DispatchOutcome::default();
            }
        };
        self.dispatch(&EventView::new(name, &payload))
    }

    pub(crate) fn dispatch(&self, event: &EventView<'_>) -> DispatchOutcome {
        if !self.run_interceptors(event) {
            debug!(target: "events", "Event {} suppressed by interceptor", event.name);
            return DispatchOutcome::default();
        }

        let listeners = self.dispatcher.snapshot(event);
        if listeners.is_empty() {
            trace!(target: "events", "No listeners for {}", event.name);
            self.dispatcher.last_canceled.set(false);
            return DispatchOutcome::default();
        }

        debug!(
            target: "events",
            "Dispatching {} to {} listener(s)",
            event.name,
            listeners.len()
        );

        self.dispatcher.frames.borrow_mut().push(Frame {
            source: event.source,
            canceled: false,
        });

        let mut outcome = DispatchOutcome::default();
        for (owner, listener, alive) in listeners {
            if !alive.get() {
                continue;
            }
            outcome.delivered = true;

            let _exec = self.enter(owner.resource_name(), None);
            let result = catch_unwind(AssertUnwindSafe(|| listener(self, event)))
                .unwrap_or_else(|panic| Err(ScriptError::from_panic(panic.as_ref())));

            if let Err(e) = result {
                outcome.listener_errors += 1;
                error!(target: "events",
                    "Listener of {} owned by {} failed: {}",
                    event.name,
                    owner,
                    e
                );
            }
        }

        outcome.canceled = self
            .dispatcher
            .frames
            .borrow_mut()
            .pop()
            .is_some_and(|f| f.canceled);
        self.dispatcher.last_canceled.set(outcome.canceled);

        outcome
    }

    fn run_interceptors(&self, event: &EventView<'_>) -> bool {
        let interceptors: Vec<Interceptor> = self
            .dispatcher
            .interceptors
            .borrow()
            .iter()
            .map(|(_, i)| i.clone())
            .collect();

        interceptors.into_iter().all(|interceptor| {
            catch_unwind(AssertUnwindSafe(|| interceptor(event))).unwrap_or_else(|_| {
                error!(target: "events", "Interceptor panicked on {}, letting it through", event.name);
                true
            })
        })
    }
}
