/// Failures while turning a value list into bytes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// A function reference was found in a payload bound for the network
    #[error("function reference {0} cannot cross a network boundary")]
    RefNotWireSafe(String),
    /// Nesting exceeded [`crate::MAX_DEPTH`]
    #[error("value nesting exceeds the depth limit")]
    DepthLimitExceeded,
    /// A string, blob or container is longer than the format can describe
    #[error("length {0} does not fit in a 32-bit length prefix")]
    LengthOverflow(usize),
}

/// Failures while reading a value list back out of bytes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Input ended in the middle of a value
    #[error("unexpected end of input")]
    UnexpectedEnd,
    /// Byte is not a valid MessagePack marker (0xc1)
    #[error("invalid marker byte {0:#04x}")]
    InvalidMarker(u8),
    /// String data is not valid UTF-8
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    /// Top-level value was not an array
    #[error("payload is not an argument array")]
    NotAnArray,
    /// An unsigned integer does not fit in an i64
    #[error("integer does not fit in 64-bit signed range")]
    IntegerOutOfRange,
    /// Extension type id this codec does not know
    #[error("unknown extension type {0}")]
    UnknownExtension(i8),
    /// Function reference extension with a malformed body
    #[error("invalid function reference '{0}'")]
    InvalidFunctionRef(String),
    /// Nesting exceeded [`crate::MAX_DEPTH`]
    #[error("value nesting exceeds the depth limit")]
    DepthLimitExceeded,
    /// Bytes left over after the top-level array
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Either side of the codec, for operations that both read and re-check a payload
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}
