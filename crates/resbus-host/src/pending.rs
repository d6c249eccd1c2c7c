//! Pending calls
//!
//! Work that crosses an asynchronous boundary (an HTTP request, a remote call) gets a
//! token instead of blocking the tick thread. Whoever finishes the work completes the
//! token through a [`PendingCompleter`] from any thread; the response is delivered on
//! the next tick as `[token, ok, ...values]`, either as an event or as a call to a
//! function reference. Tokens that outlive their deadline are completed with
//! `[token, false, "timeout"]`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use resbus_codec::{FunctionRefId, Value};
use resbus_events::{QueueError, ResourceFilter};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::dispatcher::EventView;
use crate::manager::ResourceManager;

/// Where the eventual response goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseHandler {
    Event {
        name: String,
        filter: Option<ResourceFilter>,
    },
    Ref(FunctionRefId),
}

#[derive(Debug, Clone)]
struct PendingCall {
    handler: ResponseHandler,
    owner: Option<String>,
    created_at: Instant,
    /// `None` when the timeout reaches past what `Instant` can represent
    deadline: Option<Instant>,
}

#[derive(Debug)]
struct Completion {
    token: u32,
    ok: bool,
    values: Vec<Value>,
}

/// Completes pending tokens from any thread
#[derive(Debug, Clone)]
pub struct PendingCompleter {
    tx: UnboundedSender<Completion>,
}

impl PendingCompleter {
    pub fn complete(&self, token: u32, values: Vec<Value>) -> Result<(), QueueError> {
        self.send(Completion {
            token,
            ok: true,
            values,
        })
    }

    pub fn fail(&self, token: u32, message: impl Into<String>) -> Result<(), QueueError> {
        self.send(Completion {
            token,
            ok: false,
            values: vec![Value::String(message.into())],
        })
    }

    fn send(&self, completion: Completion) -> Result<(), QueueError> {
        self.tx.send(completion).map_err(|_| QueueError::Closed)
    }
}

/// Ledger of outstanding tokens, owned by the tick thread
pub(crate) struct PendingCalls {
    calls: RefCell<HashMap<u32, PendingCall>>,
    next_token: Cell<u32>,
    default_timeout: Duration,
    tx: UnboundedSender<Completion>,
    rx: RefCell<UnboundedReceiver<Completion>>,
}

impl PendingCalls {
    pub(crate) fn new(default_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            calls: RefCell::new(HashMap::new()),
            next_token: Cell::new(0),
            default_timeout,
            tx,
            rx: RefCell::new(rx),
        }
    }

    pub(crate) fn completer(&self) -> PendingCompleter {
        PendingCompleter {
            tx: self.tx.clone(),
        }
    }

    fn issue(&self, handler: ResponseHandler, owner: Option<String>, timeout: Duration) -> u32 {
        let mut calls = self.calls.borrow_mut();

        // Non-zero, skipping tokens still outstanding after a wrap
        let mut token = self.next_token.get();
        loop {
            token = token.wrapping_add(1);
            if token != 0 && !calls.contains_key(&token) {
                break;
            }
        }
        self.next_token.set(token);

        let now = Instant::now();
        calls.insert(
            token,
            PendingCall {
                handler,
                owner,
                created_at: now,
                deadline: now.checked_add(timeout),
            },
        );
        token
    }

    /// Collect responses that arrived plus calls whose deadline passed
    fn take_due(&self, now: Instant) -> (Vec<(u32, PendingCall, Completion)>, usize) {
        let arrived: Vec<Completion> = {
            let mut rx = self.rx.borrow_mut();
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };

        let mut calls = self.calls.borrow_mut();
        let mut due = Vec::new();

        for completion in arrived {
            match calls.remove(&completion.token) {
                Some(call) => due.push((completion.token, call, completion)),
                None => {
                    debug!(target: "bridge", "Ignoring completion of unknown token {}", completion.token)
                }
            }
        }
        let completed = due.len();

        let mut expired: Vec<u32> = calls
            .iter()
            .filter(|(_, call)| call.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(token, _)| *token)
            .collect();
        expired.sort_unstable();

        for token in expired {
            if let Some(call) = calls.remove(&token) {
                let timeout = Completion {
                    token,
                    ok: false,
                    values: vec![Value::from("timeout")],
                };
                due.push((token, call, timeout));
            }
        }

        (due, completed)
    }

    fn cancel(&self, token: u32) -> bool {
        self.calls.borrow_mut().remove(&token).is_some()
    }

    pub(crate) fn cancel_owner(&self, owner: &str) -> usize {
        let mut calls = self.calls.borrow_mut();
        let before = calls.len();
        calls.retain(|_, call| call.owner.as_deref() != Some(owner));
        before - calls.len()
    }

    fn len(&self) -> usize {
        self.calls.borrow().len()
    }
}

impl ResourceManager {
    /// Start tracking an asynchronous operation and return its token
    ///
    /// `owner` ties the token to a resource: stopping it drops the token unanswered.
    /// Without `timeout` the manager's default deadline applies.
    pub fn issue_pending(
        &self,
        handler: ResponseHandler,
        owner: Option<&str>,
        timeout: Option<Duration>,
    ) -> u32 {
        let timeout = timeout.unwrap_or(self.pending.default_timeout);
        let token = self
            .pending
            .issue(handler, owner.map(str::to_string), timeout);
        debug!(target: "bridge", "Issued pending token {} (timeout {:?})", token, timeout);
        token
    }

    /// Forget a token without delivering anything
    pub fn cancel_pending(&self, token: u32) -> bool {
        self.pending.cancel(token)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Returns (completed, expired) counts
    pub(crate) fn deliver_pending(&self, now: Instant) -> (usize, usize) {
        let (due, completed) = self.pending.take_due(now);
        let expired = due.len() - completed;

        for (token, call, completion) in due {
            debug!(target: "bridge",
                "Delivering token {} (ok: {}) after {:?}",
                token,
                completion.ok,
                now.saturating_duration_since(call.created_at)
            );

            let mut args = Vec::with_capacity(completion.values.len() + 2);
            args.push(Value::from(token));
            args.push(Value::Bool(completion.ok));
            args.extend(completion.values);

            let payload = match resbus_codec::serialize(&args) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(target: "bridge", "Could not encode response for token {}: {}", token, e);
                    continue;
                }
            };

            match call.handler {
                ResponseHandler::Event { name, filter } => {
                    let view = EventView {
                        name: &name,
                        payload: &payload,
                        source: None,
                        target: filter.as_ref(),
                    };
                    self.dispatch(&view);
                }
                ResponseHandler::Ref(func) => {
                    if let Err(e) = self.call_ref(&func, &payload) {
                        warn!(target: "bridge", "Response for token {} to {} failed: {}", token, func, e);
                    }
                }
            }
        }

        (completed, expired)
    }
}
