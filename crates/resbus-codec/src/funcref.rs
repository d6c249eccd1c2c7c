use std::fmt;
use std::str::FromStr;

/// Wire identity of a function reference owned by a resource's script runtime
///
/// The canonical text form is `resource:instance:slot`. The resource name may itself
/// contain `:`, so parsing splits from the right.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionRefId {
    /// Name of the owning resource
    pub resource: String,
    /// Runtime instance id; changes every time the resource is started
    pub instance: u32,
    /// Slot in the owning runtime's reference table
    pub slot: u32,
}

impl FunctionRefId {
    pub fn new(resource: impl Into<String>, instance: u32, slot: u32) -> Self {
        Self {
            resource: resource.into(),
            instance,
            slot,
        }
    }

    /// Same owner and instance, different slot
    pub fn with_slot(&self, slot: u32) -> Self {
        Self {
            resource: self.resource.clone(),
            instance: self.instance,
            slot,
        }
    }
}

impl fmt::Display for FunctionRefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.resource, self.instance, self.slot)
    }
}

/// Error returned when a canonical reference string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{0}' is not a resource:instance:slot reference")]
pub struct ParseRefError(pub String);

impl FromStr for FunctionRefId {
    type Err = ParseRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRefError(s.to_string());

        let mut parts = s.rsplitn(3, ':');
        let slot = parts.next().ok_or_else(err)?;
        let instance = parts.next().ok_or_else(err)?;
        let resource = parts.next().ok_or_else(err)?;

        if resource.is_empty() {
            return Err(err());
        }

        Ok(Self {
            resource: resource.to_string(),
            instance: instance.parse().map_err(|_| err())?,
            slot: slot.parse().map_err(|_| err())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_form() {
        let id = FunctionRefId::new("chat", 42, 7);
        assert_eq!(id.to_string(), "chat:42:7");
        assert_eq!("chat:42:7".parse::<FunctionRefId>().unwrap(), id);
    }

    #[test]
    fn test_resource_name_with_colon() {
        let id: FunctionRefId = "[gameplay]:chat:3:1".parse().unwrap();
        assert_eq!(id.resource, "[gameplay]:chat");
        assert_eq!(id.instance, 3);
        assert_eq!(id.slot, 1);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!("chat".parse::<FunctionRefId>().is_err());
        assert!("chat:1".parse::<FunctionRefId>().is_err());
        assert!(":1:2".parse::<FunctionRefId>().is_err());
        assert!("chat:x:2".parse::<FunctionRefId>().is_err());
        assert!("chat:1:-2".parse::<FunctionRefId>().is_err());
    }
}
