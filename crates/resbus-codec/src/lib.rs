//! Argument codec for resbus
//!
//! Events and cross-resource calls carry their arguments as a single MessagePack array.
//! Scalars, strings, byte blobs, nested arrays and maps map onto the standard MessagePack
//! families; function references travel as extension type 10 holding the canonical
//! `resource:instance:slot` string.
//!
//! Payloads that leave the process are encoded with [`SerializeMode::Network`], which
//! refuses function references: their handles only mean something inside the runtime
//! that created them.

mod decode;
mod encode;
mod error;
mod funcref;
mod value;

pub use decode::Decoder;
pub use encode::{Encoder, SerializeMode};
pub use error::{CodecError, DecodeError, EncodeError};
pub use funcref::{FunctionRefId, ParseRefError};
pub use value::Value;

/// MessagePack extension type used for function references
pub const FUNC_REF_EXT: i8 = 10;

/// Maximum nesting of arrays and maps inside an argument list
pub const MAX_DEPTH: usize = 64;

/// Encode an argument list for in-process delivery
pub fn serialize(args: &[Value]) -> Result<Vec<u8>, EncodeError> {
    serialize_with(args, SerializeMode::Local)
}

pub fn serialize_with(args: &[Value], mode: SerializeMode) -> Result<Vec<u8>, EncodeError> {
    let mut enc = Encoder::new(mode);
    enc.write_args(args)?;
    Ok(enc.finish())
}

/// Decode an argument list
pub fn deserialize(bytes: &[u8]) -> Result<Vec<Value>, DecodeError> {
    Decoder::new(bytes).read_args()
}

/// Verify an already encoded payload is safe to send over the network
///
/// Fails with [`EncodeError::RefNotWireSafe`] when any function reference is present,
/// at any depth.
pub fn check_wire_safe(bytes: &[u8]) -> Result<(), CodecError> {
    let args = deserialize(bytes)?;
    match args.iter().find_map(find_ref) {
        Some(r) => Err(EncodeError::RefNotWireSafe(r.to_string()).into()),
        None => Ok(()),
    }
}

fn find_ref(value: &Value) -> Option<&FunctionRefId> {
    match value {
        Value::FuncRef(r) => Some(r),
        Value::Array(items) => items.iter().find_map(find_ref),
        Value::Map(entries) => entries
            .iter()
            .find_map(|(k, v)| find_ref(k).or_else(|| find_ref(v))),
        _ => None,
    }
}

/// Build an argument list from anything convertible into [`Value`]
///
/// ```
/// use resbus_codec::{args, Value};
/// let a = args!["hello", 42, true];
/// assert_eq!(a, vec![Value::from("hello"), Value::Int(42), Value::Bool(true)]);
/// ```
#[macro_export]
macro_rules! args {
    () => { ::std::vec::Vec::<$crate::Value>::new() };
    ($($x:expr),+ $(,)?) => { ::std::vec![$($crate::Value::from($x)),+] };
}
