use byteorder::{BigEndian, ByteOrder};

use crate::error::DecodeError;
use crate::funcref::FunctionRefId;
use crate::value::Value;
use crate::{FUNC_REF_EXT, MAX_DEPTH};

/// Bounds-checked reader over a borrowed payload
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Reads the top-level argument array and requires the input to end there
    pub fn read_args(&mut self) -> Result<Vec<Value>, DecodeError> {
        let marker = self.peek()?;
        let len = match marker {
            0x90..=0x9f => {
                self.pos += 1;
                (marker & 0x0f) as usize
            }
            0xdc => {
                self.pos += 1;
                self.read_u16()? as usize
            }
            0xdd => {
                self.pos += 1;
                self.read_u32()? as usize
            }
            _ => return Err(DecodeError::NotAnArray),
        };

        let args = self.read_seq(len, 1)?;

        let remaining = self.remaining();
        if remaining != 0 {
            return Err(DecodeError::TrailingBytes(remaining));
        }

        Ok(args)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_seq(&mut self, len: usize, depth: usize) -> Result<Vec<Value>, DecodeError> {
        // Every element takes at least one byte, so a hostile length cannot over-allocate
        if len > self.remaining() {
            return Err(DecodeError::UnexpectedEnd);
        }
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(self.read_value(depth)?);
        }
        Ok(out)
    }

    fn read_map(&mut self, len: usize, depth: usize) -> Result<Value, DecodeError> {
        if len.saturating_mul(2) > self.remaining() {
            return Err(DecodeError::UnexpectedEnd);
        }
        let mut entries = Vec::with_capacity(len);
        for _ in 0..len {
            let k = self.read_value(depth)?;
            let v = self.read_value(depth)?;
            entries.push((k, v));
        }
        Ok(Value::Map(entries))
    }

    fn read_value(&mut self, depth: usize) -> Result<Value, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::DepthLimitExceeded);
        }

        let marker = self.read_u8()?;
        let value = match marker {
            0x00..=0x7f => Value::Int(marker as i64),
            0x80..=0x8f => self.read_map((marker & 0x0f) as usize, depth + 1)?,
            0x90..=0x9f => Value::Array(self.read_seq((marker & 0x0f) as usize, depth + 1)?),
            0xa0..=0xbf => Value::String(self.read_string((marker & 0x1f) as usize)?),
            0xc0 => Value::Nil,
            0xc1 => return Err(DecodeError::InvalidMarker(marker)),
            0xc2 => Value::Bool(false),
            0xc3 => Value::Bool(true),
            0xc4 => {
                let len = self.read_u8()? as usize;
                Value::Bytes(self.take(len)?.to_vec())
            }
            0xc5 => {
                let len = self.read_u16()? as usize;
                Value::Bytes(self.take(len)?.to_vec())
            }
            0xc6 => {
                let len = self.read_u32()? as usize;
                Value::Bytes(self.take(len)?.to_vec())
            }
            0xc7 => {
                let len = self.read_u8()? as usize;
                self.read_ext(len)?
            }
            0xc8 => {
                let len = self.read_u16()? as usize;
                self.read_ext(len)?
            }
            0xc9 => {
                let len = self.read_u32()? as usize;
                self.read_ext(len)?
            }
            0xca => Value::Float(BigEndian::read_f32(self.take(4)?) as f64),
            0xcb => Value::Float(BigEndian::read_f64(self.take(8)?)),
            0xcc => Value::Int(self.read_u8()? as i64),
            0xcd => Value::Int(self.read_u16()? as i64),
            0xce => Value::Int(self.read_u32()? as i64),
            0xcf => {
                let u = BigEndian::read_u64(self.take(8)?);
                Value::Int(i64::try_from(u).map_err(|_| DecodeError::IntegerOutOfRange)?)
            }
            0xd0 => Value::Int(self.read_u8()? as i8 as i64),
            0xd1 => Value::Int(BigEndian::read_i16(self.take(2)?) as i64),
            0xd2 => Value::Int(BigEndian::read_i32(self.take(4)?) as i64),
            0xd3 => Value::Int(BigEndian::read_i64(self.take(8)?)),
            0xd4 => self.read_ext(1)?,
            0xd5 => self.read_ext(2)?,
            0xd6 => self.read_ext(4)?,
            0xd7 => self.read_ext(8)?,
            0xd8 => self.read_ext(16)?,
            0xd9 => {
                let len = self.read_u8()? as usize;
                Value::String(self.read_string(len)?)
            }
            0xda => {
                let len = self.read_u16()? as usize;
                Value::String(self.read_string(len)?)
            }
            0xdb => {
                let len = self.read_u32()? as usize;
                Value::String(self.read_string(len)?)
            }
            0xdc => {
                let len = self.read_u16()? as usize;
                Value::Array(self.read_seq(len, depth + 1)?)
            }
            0xdd => {
                let len = self.read_u32()? as usize;
                Value::Array(self.read_seq(len, depth + 1)?)
            }
            0xde => {
                let len = self.read_u16()? as usize;
                self.read_map(len, depth + 1)?
            }
            0xdf => {
                let len = self.read_u32()? as usize;
                self.read_map(len, depth + 1)?
            }
            0xe0..=0xff => Value::Int(marker as i8 as i64),
        };

        Ok(value)
    }

    fn read_ext(&mut self, len: usize) -> Result<Value, DecodeError> {
        let ty = self.read_u8()? as i8;
        let body = self.take(len)?;

        if ty != FUNC_REF_EXT {
            return Err(DecodeError::UnknownExtension(ty));
        }

        let text = std::str::from_utf8(body).map_err(|_| DecodeError::InvalidUtf8)?;
        let id = text
            .parse::<FunctionRefId>()
            .map_err(|_| DecodeError::InvalidFunctionRef(text.to_string()))?;
        Ok(Value::FuncRef(id))
    }

    fn read_string(&mut self, len: usize) -> Result<String, DecodeError> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn peek(&self) -> Result<u8, DecodeError> {
        self.buf.get(self.pos).copied().ok_or(DecodeError::UnexpectedEnd)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::UnexpectedEnd)?;
        let slice = self.buf.get(self.pos..end).ok_or(DecodeError::UnexpectedEnd)?;
        self.pos = end;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Result<Vec<Value>, DecodeError> {
        Decoder::new(bytes).read_args()
    }

    #[test]
    fn test_accepts_float32() {
        let args = decode(&[0x91, 0xca, 0x3f, 0xc0, 0x00, 0x00]).unwrap();
        assert_eq!(args, vec![Value::Float(1.5)]);
    }

    #[test]
    fn test_negative_fixint() {
        assert_eq!(decode(&[0x91, 0xe0]).unwrap(), vec![Value::Int(-32)]);
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(decode(&[]), Err(DecodeError::UnexpectedEnd));
        assert_eq!(decode(&[0x92, 0x01]), Err(DecodeError::UnexpectedEnd));
        assert_eq!(decode(&[0x91, 0xa5, b'a']), Err(DecodeError::UnexpectedEnd));
        assert_eq!(decode(&[0x91, 0xcd, 0x01]), Err(DecodeError::UnexpectedEnd));
    }

    #[test]
    fn test_hostile_array_length() {
        // array32 claiming four billion elements in a five byte buffer
        assert_eq!(
            decode(&[0xdd, 0xff, 0xff, 0xff, 0xff]),
            Err(DecodeError::UnexpectedEnd)
        );
    }

    #[test]
    fn test_top_level_must_be_array() {
        assert_eq!(decode(&[0x01]), Err(DecodeError::NotAnArray));
        assert_eq!(decode(&[0x80]), Err(DecodeError::NotAnArray));
    }

    #[test]
    fn test_invalid_marker() {
        assert_eq!(decode(&[0x91, 0xc1]), Err(DecodeError::InvalidMarker(0xc1)));
    }

    #[test]
    fn test_trailing_bytes() {
        assert_eq!(decode(&[0x90, 0x00, 0x00]), Err(DecodeError::TrailingBytes(2)));
    }

    #[test]
    fn test_uint64_out_of_range() {
        let bytes = [0x91, 0xcf, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        assert_eq!(decode(&bytes), Err(DecodeError::IntegerOutOfRange));
    }

    #[test]
    fn test_unknown_extension() {
        assert_eq!(
            decode(&[0x91, 0xd4, 0x05, 0x00]),
            Err(DecodeError::UnknownExtension(5))
        );
    }

    #[test]
    fn test_bad_func_ref_body() {
        let mut bytes = vec![0x91, 0xc7, 3, 10];
        bytes.extend_from_slice(b"abc");
        assert_eq!(
            decode(&bytes),
            Err(DecodeError::InvalidFunctionRef("abc".to_string()))
        );
    }

    #[test]
    fn test_invalid_utf8() {
        assert_eq!(decode(&[0x91, 0xa1, 0xff]), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn test_depth_bomb() {
        let mut bytes = vec![0x91];
        bytes.extend(std::iter::repeat(0x91).take(MAX_DEPTH + 8));
        bytes.push(0xc0);
        assert_eq!(decode(&bytes), Err(DecodeError::DepthLimitExceeded));
    }
}
