//! Tagged values and their single-allocation wire encoding.
//!
//! Only kinds that survive a hop between isolated interpreters exist here;
//! reference kinds (tables, functions, foreign handles) are unrepresentable
//! by construction, except for transparent opaque pointers.
use crate::error::{Error, Result};
use std::ffi::c_void;

/// Wire tag: boolean true, no payload.
const TAG_TRUE: u8 = 0;
/// Wire tag: boolean false, no payload.
const TAG_FALSE: u8 = 1;
/// Wire tag: opaque machine pointer.
const TAG_LIGHT_POINTER: u8 = 2;
/// Wire tag: 64-bit float.
const TAG_NUMBER: u8 = 3;
/// Wire tag: 64-bit signed integer.
const TAG_INTEGER: u8 = 4;
/// Wire tag: length-prefixed byte string.
const TAG_STRING: u8 = 5;

/// An opaque pointer that may be handed across threads unchanged.
///
/// The runtime never dereferences or frees it; whoever produced the pointer
/// guarantees it stays valid for every thread that may pop it. That contract
/// is the caller's, which is why the `Send` impl is ours to assert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightPtr(pub *mut c_void);

// Pointers are carried, not used; validity across threads is the producer's
// contract (see the type docs).
unsafe impl Send for LightPtr {}

/// A value a channel can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A boolean.
    Bool(bool),
    /// A 64-bit signed integer.
    Integer(i64),
    /// A 64-bit float.
    Number(f64),
    /// An arbitrary byte string, possibly empty.
    Str(Vec<u8>),
    /// A transparent opaque pointer.
    Pointer(LightPtr),
}

impl Value {
    /// Encodes into one freshly allocated item: tag byte, then payload.
    pub(crate) fn encode(&self) -> Box<[u8]> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        match self {
            Self::Bool(true) => buf.push(TAG_TRUE),
            Self::Bool(false) => buf.push(TAG_FALSE),
            Self::Integer(v) => {
                buf.push(TAG_INTEGER);
                buf.extend_from_slice(&v.to_ne_bytes());
            }
            Self::Number(v) => {
                buf.push(TAG_NUMBER);
                buf.extend_from_slice(&v.to_ne_bytes());
            }
            Self::Str(bytes) => {
                buf.push(TAG_STRING);
                buf.extend_from_slice(&(bytes.len() as u64).to_ne_bytes());
                buf.extend_from_slice(bytes);
            }
            Self::Pointer(ptr) => {
                buf.push(TAG_LIGHT_POINTER);
                buf.extend_from_slice(&(ptr.0 as usize).to_ne_bytes());
            }
        }
        buf.into_boxed_slice()
    }

    /// Size of the encoded form in bytes.
    pub(crate) fn encoded_size(&self) -> usize {
        1 + match self {
            Self::Bool(_) => 0,
            Self::Integer(_) | Self::Number(_) => 8,
            Self::Str(bytes) => 8 + bytes.len(),
            Self::Pointer(_) => std::mem::size_of::<usize>(),
        }
    }

    /// Decodes an item produced by [`Value::encode`].
    /// Items only ever come from our own encoder, so any mismatch is an
    /// internal invariant violation, not caller input.
    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        let (&tag, payload) = buf
            .split_first()
            .ok_or(Error::Internal("empty queue item"))?;
        match tag {
            TAG_TRUE if payload.is_empty() => Ok(Self::Bool(true)),
            TAG_FALSE if payload.is_empty() => Ok(Self::Bool(false)),
            TAG_INTEGER => Ok(Self::Integer(i64::from_ne_bytes(fixed(payload)?))),
            TAG_NUMBER => Ok(Self::Number(f64::from_ne_bytes(fixed(payload)?))),
            TAG_STRING => {
                if payload.len() < 8 {
                    return Err(Error::Internal("truncated string item"));
                }
                let (len, bytes) = payload.split_at(8);
                if u64::from_ne_bytes(fixed(len)?) != bytes.len() as u64 {
                    return Err(Error::Internal("string item length mismatch"));
                }
                Ok(Self::Str(bytes.to_vec()))
            }
            TAG_LIGHT_POINTER => {
                let addr = usize::from_ne_bytes(fixed(payload)?);
                Ok(Self::Pointer(LightPtr(addr as *mut c_void)))
            }
            _ => Err(Error::Internal("unknown item tag")),
        }
    }
}

/// Payload of an exact fixed width, or an internal error.
fn fixed<const N: usize>(payload: &[u8]) -> Result<[u8; N]> {
    payload
        .try_into()
        .map_err(|_| Error::Internal("malformed fixed-width item"))
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v.into_bytes())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Str(v)
    }
}

impl From<LightPtr> for Value {
    fn from(v: LightPtr) -> Self {
        Self::Pointer(v)
    }
}
