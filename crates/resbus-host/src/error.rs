use resbus_codec::{CodecError, DecodeError, EncodeError};
use resbus_events::QueueError;

use crate::resource::ResourceState;

/// Error raised by script code, carried verbatim to whoever invoked it
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ScriptError(pub String);

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    /// Build an error from a caught panic payload
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self(format!("panicked: {}", message))
    }
}

impl From<DecodeError> for ScriptError {
    fn from(e: DecodeError) -> Self {
        Self(format!("invalid arguments: {}", e))
    }
}

impl From<EncodeError> for ScriptError {
    fn from(e: EncodeError) -> Self {
        Self(format!("unencodable result: {}", e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("resource '{0}' is already registered")]
    DuplicateResource(String),
    #[error("resource '{0}' not found")]
    ResourceNotFound(String),
    #[error("resource '{resource}' is {state}, only stopped resources can be unregistered")]
    NotStopped {
        resource: String,
        state: ResourceState,
    },
    #[error("resource '{resource}' is still required by {dependants:?}")]
    HasDependants {
        resource: String,
        dependants: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("resource '{0}' not found")]
    ResourceNotFound(String),
    #[error("resource '{resource}' is {state}")]
    InvalidState {
        resource: String,
        state: ResourceState,
    },
    #[error("resource '{resource}' is still required by {dependants:?}")]
    HasDependants {
        resource: String,
        dependants: Vec<String>,
    },
    #[error("resource '{resource}' depends on '{dependency}', which is not registered")]
    MissingDependency { resource: String, dependency: String },
    #[error("resource '{resource}' could not start dependency '{dependency}': {source}")]
    DependencyFailed {
        resource: String,
        dependency: String,
        #[source]
        source: Box<LifecycleError>,
    },
    #[error("dependency cycle: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },
    #[error("start of resource '{0}' was canceled")]
    StartCanceled(String),
    #[error("resource '{resource}' failed to load: {source}")]
    LoadFailed {
        resource: String,
        #[source]
        source: ScriptError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("reference {0} is stale")]
    StaleReference(String),
    #[error("resource '{resource}' has no export '{export}'")]
    ExportNotFound { resource: String, export: String },
    #[error("resource '{0}' not found")]
    ResourceNotFound(String),
    #[error("script error: {0}")]
    Script(#[from] ScriptError),
    #[error("could not decode call result: {0}")]
    Decode(#[from] DecodeError),
    #[error("could not encode call arguments: {0}")]
    Encode(#[from] EncodeError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("no event is being dispatched")]
    NoActiveDispatch,
    #[error("'{0}' is a reserved event name")]
    ReservedName(String),
    #[error("no network sink is configured")]
    NoNetSink,
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Envelope(#[from] resbus_events::NetError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TickError {
    #[error("tick() called while a tick is already running")]
    Reentrant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(ScriptError::from_panic(payload.as_ref()).0, "panicked: boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(ScriptError::from_panic(payload.as_ref()).0, "panicked: bang");
    }

    #[test]
    fn test_cycle_message() {
        let e = LifecycleError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(e.to_string(), "dependency cycle: a -> b -> a");
    }
}
