/// Core event types for resbus
///
/// This crate holds the types shared by producers (scripts, network decoders, host
/// components) and the dispatcher, so producers on other threads only need this crate
/// and a cloned [`EventSender`].
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use resbus_codec::{DecodeError, EncodeError, Value};

pub mod net;
pub mod queue;

pub use net::{DEFAULT_MAX_ENVELOPE_SIZE, NetEnvelope, NetError, NetSink, NetTarget};
pub use queue::{EventQueue, EventSender, QueueError, QueueLimit};

// ============================================================================
// Reserved Names
// ============================================================================

/// Event names emitted by the resource lifecycle
///
/// Each is triggered with a single argument: the resource name.
pub mod names {
    pub const RESOURCE_STARTING: &str = "resourceStarting";
    pub const RESOURCE_STARTED: &str = "resourceStarted";
    pub const RESOURCE_STOPPING: &str = "resourceStopping";
    pub const RESOURCE_STOPPED: &str = "resourceStopped";

    pub const RESERVED: [&str; 4] = [
        RESOURCE_STARTING,
        RESOURCE_STARTED,
        RESOURCE_STOPPING,
        RESOURCE_STOPPED,
    ];

    pub fn is_reserved(name: &str) -> bool {
        RESERVED.contains(&name)
    }
}

// ============================================================================
// Sources and Targets
// ============================================================================

/// Network id of a remote peer
///
/// Rendered as `net:<id>`, the form scripts see as the event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u16);

impl PeerId {
    /// Peer id the server uses when talking to clients
    pub const SERVER: PeerId = PeerId(0);
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net:{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("net:")
            .and_then(|id| id.parse().ok())
            .map(PeerId)
            .ok_or_else(|| format!("'{}' is not a net:<id> source", s))
    }
}

/// Name of a non-resource host component that listens to events
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentRef(pub String);

impl ComponentRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "component:{}", self.0)
    }
}

/// Who registered a listener
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerOwner {
    /// A resource; the listener goes away when the resource stops
    Resource(String),
    /// A host component; lives until unsubscribed
    Component(ComponentRef),
}

impl ListenerOwner {
    pub fn resource_name(&self) -> Option<&str> {
        match self {
            ListenerOwner::Resource(name) => Some(name),
            ListenerOwner::Component(_) => None,
        }
    }
}

impl fmt::Display for ListenerOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerOwner::Resource(name) => write!(f, "{}", name),
            ListenerOwner::Component(c) => write!(f, "{}", c),
        }
    }
}

/// Which listeners a targeted event reaches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceFilter {
    /// Every resource-owned listener; host components are skipped
    AllResources,
    /// Only listeners owned by this resource
    SpecificResource(String),
    /// Only listeners owned by this host component
    Component(ComponentRef),
}

impl ResourceFilter {
    pub fn resource(name: impl Into<String>) -> Self {
        ResourceFilter::SpecificResource(name.into())
    }

    pub fn matches(&self, owner: &ListenerOwner) -> bool {
        match (self, owner) {
            (ResourceFilter::AllResources, ListenerOwner::Resource(_)) => true,
            (ResourceFilter::SpecificResource(want), ListenerOwner::Resource(have)) => {
                want == have
            }
            (ResourceFilter::Component(want), ListenerOwner::Component(have)) => want == have,
            _ => false,
        }
    }
}

// ============================================================================
// Event
// ============================================================================

/// A named event with a serialized argument payload
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    /// Codec-encoded argument array
    pub payload: Vec<u8>,
    /// Remote peer the event came from, if any
    pub source: Option<PeerId>,
    /// Restricts delivery; `None` reaches every listener
    pub target: Option<ResourceFilter>,
    pub queued_at: Instant,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            payload,
            source: None,
            target: None,
            queued_at: Instant::now(),
        }
    }

    /// Serialize `args` into a new event
    pub fn from_args(name: impl Into<String>, args: &[Value]) -> Result<Self, EncodeError> {
        Ok(Self::new(name, resbus_codec::serialize(args)?))
    }

    pub fn with_source(mut self, source: PeerId) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_target(mut self, target: ResourceFilter) -> Self {
        self.target = Some(target);
        self
    }

    pub fn args(&self) -> Result<Vec<Value>, DecodeError> {
        resbus_codec::deserialize(&self.payload)
    }
}
