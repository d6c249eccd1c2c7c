use byteorder::{BigEndian, ByteOrder};

use crate::error::EncodeError;
use crate::value::Value;
use crate::{FUNC_REF_EXT, MAX_DEPTH};

/// Where the encoded payload is going
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializeMode {
    /// Stays inside this process; function references are allowed
    #[default]
    Local,
    /// Crosses a network boundary; function references are rejected
    Network,
}

/// Appends MessagePack-encoded values to an owned buffer
pub struct Encoder {
    buf: Vec<u8>,
    mode: SerializeMode,
}

impl Encoder {
    pub fn new(mode: SerializeMode) -> Self {
        Self {
            buf: Vec::with_capacity(64),
            mode,
        }
    }

    /// Encodes `args` as a single top-level array
    pub fn write_args(&mut self, args: &[Value]) -> Result<(), EncodeError> {
        self.write_array_header(args.len())?;
        for arg in args {
            self.write_value(arg, 1)?;
        }
        Ok(())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn write_value(&mut self, value: &Value, depth: usize) -> Result<(), EncodeError> {
        if depth > MAX_DEPTH {
            return Err(EncodeError::DepthLimitExceeded);
        }

        match value {
            Value::Nil => self.buf.push(0xc0),
            Value::Bool(false) => self.buf.push(0xc2),
            Value::Bool(true) => self.buf.push(0xc3),
            Value::Int(i) => self.write_int(*i),
            Value::Float(f) => {
                let mut tmp = [0u8; 8];
                BigEndian::write_f64(&mut tmp, *f);
                self.buf.push(0xcb);
                self.buf.extend_from_slice(&tmp);
            }
            Value::String(s) => self.write_str(s)?,
            Value::Bytes(b) => {
                self.write_len_prefix(b.len(), Some(0xc4), 0xc5, 0xc6)?;
                self.buf.extend_from_slice(b);
            }
            Value::Array(items) => {
                self.write_array_header(items.len())?;
                for item in items {
                    self.write_value(item, depth + 1)?;
                }
            }
            Value::Map(entries) => {
                if entries.len() < 16 {
                    self.buf.push(0x80 | entries.len() as u8);
                } else {
                    self.write_len_prefix(entries.len(), None, 0xde, 0xdf)?;
                }
                for (k, v) in entries {
                    self.write_value(k, depth + 1)?;
                    self.write_value(v, depth + 1)?;
                }
            }
            Value::FuncRef(r) => {
                let canonical = r.to_string();
                if self.mode == SerializeMode::Network {
                    return Err(EncodeError::RefNotWireSafe(canonical));
                }
                self.write_ext(FUNC_REF_EXT, canonical.as_bytes())?;
            }
        }

        Ok(())
    }

    fn write_int(&mut self, i: i64) {
        let mut tmp = [0u8; 8];
        if i >= 0 {
            let u = i as u64;
            if u <= 0x7f {
                self.buf.push(u as u8);
            } else if u <= u8::MAX as u64 {
                self.buf.push(0xcc);
                self.buf.push(u as u8);
            } else if u <= u16::MAX as u64 {
                BigEndian::write_u16(&mut tmp, u as u16);
                self.buf.push(0xcd);
                self.buf.extend_from_slice(&tmp[..2]);
            } else if u <= u32::MAX as u64 {
                BigEndian::write_u32(&mut tmp, u as u32);
                self.buf.push(0xce);
                self.buf.extend_from_slice(&tmp[..4]);
            } else {
                BigEndian::write_u64(&mut tmp, u);
                self.buf.push(0xcf);
                self.buf.extend_from_slice(&tmp);
            }
        } else if i >= -32 {
            self.buf.push(i as i8 as u8);
        } else if i >= i8::MIN as i64 {
            self.buf.push(0xd0);
            self.buf.push(i as i8 as u8);
        } else if i >= i16::MIN as i64 {
            BigEndian::write_i16(&mut tmp, i as i16);
            self.buf.push(0xd1);
            self.buf.extend_from_slice(&tmp[..2]);
        } else if i >= i32::MIN as i64 {
            BigEndian::write_i32(&mut tmp, i as i32);
            self.buf.push(0xd2);
            self.buf.extend_from_slice(&tmp[..4]);
        } else {
            BigEndian::write_i64(&mut tmp, i);
            self.buf.push(0xd3);
            self.buf.extend_from_slice(&tmp);
        }
    }

    fn write_str(&mut self, s: &str) -> Result<(), EncodeError> {
        if s.len() < 32 {
            self.buf.push(0xa0 | s.len() as u8);
        } else {
            self.write_len_prefix(s.len(), Some(0xd9), 0xda, 0xdb)?;
        }
        self.buf.extend_from_slice(s.as_bytes());
        Ok(())
    }

    fn write_array_header(&mut self, len: usize) -> Result<(), EncodeError> {
        if len < 16 {
            self.buf.push(0x90 | len as u8);
            Ok(())
        } else {
            self.write_len_prefix(len, None, 0xdc, 0xdd)
        }
    }

    fn write_ext(&mut self, ty: i8, body: &[u8]) -> Result<(), EncodeError> {
        match body.len() {
            1 => self.buf.push(0xd4),
            2 => self.buf.push(0xd5),
            4 => self.buf.push(0xd6),
            8 => self.buf.push(0xd7),
            16 => self.buf.push(0xd8),
            len => self.write_len_prefix(len, Some(0xc7), 0xc8, 0xc9)?,
        }
        self.buf.push(ty as u8);
        self.buf.extend_from_slice(body);
        Ok(())
    }

    /// Writes the smallest of the 8/16/32-bit length forms
    fn write_len_prefix(
        &mut self,
        len: usize,
        marker8: Option<u8>,
        marker16: u8,
        marker32: u8,
    ) -> Result<(), EncodeError> {
        let mut tmp = [0u8; 4];
        match marker8 {
            Some(m) if len <= u8::MAX as usize => {
                self.buf.push(m);
                self.buf.push(len as u8);
            }
            _ if len <= u16::MAX as usize => {
                BigEndian::write_u16(&mut tmp, len as u16);
                self.buf.push(marker16);
                self.buf.extend_from_slice(&tmp[..2]);
            }
            _ if len <= u32::MAX as usize => {
                BigEndian::write_u32(&mut tmp, len as u32);
                self.buf.push(marker32);
                self.buf.extend_from_slice(&tmp);
            }
            _ => return Err(EncodeError::LengthOverflow(len)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FunctionRefId;

    fn encode(args: &[Value]) -> Vec<u8> {
        let mut enc = Encoder::new(SerializeMode::Local);
        enc.write_args(args).unwrap();
        enc.finish()
    }

    #[test]
    fn test_empty_args_is_fixarray() {
        assert_eq!(encode(&[]), vec![0x90]);
    }

    #[test]
    fn test_integer_widths() {
        assert_eq!(encode(&[Value::Int(5)]), vec![0x91, 0x05]);
        assert_eq!(encode(&[Value::Int(-1)]), vec![0x91, 0xff]);
        assert_eq!(encode(&[Value::Int(200)]), vec![0x91, 0xcc, 200]);
        assert_eq!(encode(&[Value::Int(-100)]), vec![0x91, 0xd0, 0x9c]);
        assert_eq!(encode(&[Value::Int(1000)]), vec![0x91, 0xcd, 0x03, 0xe8]);
        assert_eq!(
            encode(&[Value::Int(i64::MIN)]),
            vec![0x91, 0xd3, 0x80, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_scalars() {
        assert_eq!(
            encode(&[Value::Nil, Value::Bool(true), Value::Bool(false)]),
            vec![0x93, 0xc0, 0xc3, 0xc2]
        );
        assert_eq!(encode(&[Value::from("hi")]), vec![0x91, 0xa2, b'h', b'i']);
        assert_eq!(
            encode(&[Value::Bytes(vec![1, 2])]),
            vec![0x91, 0xc4, 0x02, 1, 2]
        );
    }

    #[test]
    fn test_long_string_uses_str8() {
        let s = "x".repeat(40);
        let bytes = encode(&[Value::String(s)]);
        assert_eq!(&bytes[..3], &[0x91, 0xd9, 40]);
        assert_eq!(bytes.len(), 3 + 40);
    }

    #[test]
    fn test_func_ref_is_ext_10() {
        let bytes = encode(&[Value::FuncRef(FunctionRefId::new("a", 1, 2))]);
        // "a:1:2" is 5 bytes, so ext8
        assert_eq!(&bytes[..4], &[0x91, 0xc7, 5, 10]);
        assert_eq!(&bytes[4..], b"a:1:2");
    }

    #[test]
    fn test_network_mode_rejects_refs() {
        let mut enc = Encoder::new(SerializeMode::Network);
        let nested = Value::Array(vec![Value::FuncRef(FunctionRefId::new("a", 1, 2))]);
        let err = enc.write_args(&[Value::Int(1), nested]).unwrap_err();
        assert_eq!(err, EncodeError::RefNotWireSafe("a:1:2".to_string()));
    }

    #[test]
    fn test_depth_limit() {
        let mut v = Value::Nil;
        for _ in 0..(MAX_DEPTH + 1) {
            v = Value::Array(vec![v]);
        }
        let mut enc = Encoder::new(SerializeMode::Local);
        assert_eq!(enc.write_args(&[v]), Err(EncodeError::DepthLimitExceeded));
    }
}
