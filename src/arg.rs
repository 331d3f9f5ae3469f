//! The tagged value every loggable datum is converted into.
//!
//! A record on disk is a flat array of [`Arg`] values with no length prefix,
//! so every variant encodes to exactly [`ARG_SIZE`] bytes:
//!
//! ```text
//! byte 0      tag
//! bytes 1..4  zero
//! bytes 4..8  aux (u32 LE): string length for Inline / Interned
//! bytes 8..16 payload (u64 LE)
//! ```
//!
//! Tag 0 is never produced. Freshly grown page space is zero-filled, so a
//! decoder can tell written slots from untouched ones.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::logger::Sink;
use crate::Result;

/// Encoded size of one value.
pub const ARG_SIZE: usize = 16;

/// Number of UTF-8 bytes an inline string can hold.
pub const INLINE_CAPACITY: usize = 8;

/// Tag of a zero-filled slot.
pub const UNUSED_TAG: u8 = 0;

pub const TERMINATOR_TAG: u8 = 1;
pub const TIMESTAMP_TAG: u8 = 2;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1 hash (multiply, then xor).
///
/// Long string literals are stored as this hash instead of their text; a
/// [`SymbolTable`](crate::SymbolTable) built with the same function maps them
/// back.
pub const fn fnv1_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= bytes[i] as u64;
        i += 1;
    }
    hash
}

/// A platform error code carried as its own variant.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ErrorCode(pub u64);

impl ErrorCode {
    /// Raw OS error of `err`, or 0 when it has none.
    pub fn from_io(err: &std::io::Error) -> Self {
        ErrorCode(err.raw_os_error().map_or(0, |code| code as u32 as u64))
    }
}

/// Tagged argument value.
///
/// `repr(u8)` lays every variant out as `{ tag, fields.. }`, which keeps the
/// in-memory size equal to the encoded size.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Arg {
    /// Ends a record.
    Terminator = 1,
    /// Nanoseconds since the UNIX epoch.
    Timestamp(u64) = 2,
    /// FNV-1 hash of a string literal too long to inline.
    Hash(u64) = 3,
    ErrorCode(u64) = 4,
    /// `len` bytes at absolute `offset` of the strings file.
    Interned { len: u32, offset: u64 } = 5,
    /// Up to [`INLINE_CAPACITY`] UTF-8 bytes stored in the value itself.
    Inline { len: u8, bytes: [u8; INLINE_CAPACITY] } = 6,
    U8(u8) = 7,
    I8(i8) = 8,
    U16(u16) = 9,
    I16(i16) = 10,
    U32(u32) = 11,
    I32(i32) = 12,
    U64(u64) = 13,
    I64(i64) = 14,
    F32(f32) = 15,
    F64(f64) = 16,
}

const _: () = assert!(std::mem::size_of::<Arg>() == ARG_SIZE);

impl Arg {
    /// Converts a string known at compile time: inline when it fits,
    /// otherwise its FNV-1 hash. Nothing is written anywhere.
    ///
    /// ```
    /// use pagelog::Arg;
    /// const SHORT: Arg = Arg::from_literal("test");
    /// const LONG: Arg = Arg::from_literal("a literal longer than eight bytes");
    /// assert_eq!(SHORT.inline_str(), Some("test"));
    /// assert!(matches!(LONG, Arg::Hash(_)));
    /// ```
    pub const fn from_literal(s: &str) -> Arg {
        let src = s.as_bytes();
        if src.len() <= INLINE_CAPACITY {
            let mut bytes = [0u8; INLINE_CAPACITY];
            let mut i = 0;
            while i < src.len() {
                bytes[i] = src[i];
                i += 1;
            }
            Arg::Inline {
                len: src.len() as u8,
                bytes,
            }
        } else {
            Arg::Hash(fnv1_64(src))
        }
    }

    /// Text of an inline string value.
    pub fn inline_str(&self) -> Option<&str> {
        match self {
            Arg::Inline { len, bytes } => std::str::from_utf8(&bytes[..*len as usize]).ok(),
            _ => None,
        }
    }

    pub const fn tag(&self) -> u8 {
        match self {
            Arg::Terminator => TERMINATOR_TAG,
            Arg::Timestamp(_) => TIMESTAMP_TAG,
            Arg::Hash(_) => 3,
            Arg::ErrorCode(_) => 4,
            Arg::Interned { .. } => 5,
            Arg::Inline { .. } => 6,
            Arg::U8(_) => 7,
            Arg::I8(_) => 8,
            Arg::U16(_) => 9,
            Arg::I16(_) => 10,
            Arg::U32(_) => 11,
            Arg::I32(_) => 12,
            Arg::U64(_) => 13,
            Arg::I64(_) => 14,
            Arg::F32(_) => 15,
            Arg::F64(_) => 16,
        }
    }

    /// Serializes the value into its fixed-size wire form.
    #[inline]
    pub fn encode(&self) -> [u8; ARG_SIZE] {
        let (aux, payload): (u32, u64) = match *self {
            Arg::Terminator => (0, 0),
            Arg::Timestamp(v) | Arg::Hash(v) | Arg::ErrorCode(v) | Arg::U64(v) => (0, v),
            Arg::Interned { len, offset } => (len, offset),
            Arg::Inline { len, bytes } => (len as u32, u64::from_le_bytes(bytes)),
            Arg::U8(v) => (0, v as u64),
            Arg::I8(v) => (0, v as i64 as u64),
            Arg::U16(v) => (0, v as u64),
            Arg::I16(v) => (0, v as i64 as u64),
            Arg::U32(v) => (0, v as u64),
            Arg::I32(v) => (0, v as i64 as u64),
            Arg::I64(v) => (0, v as u64),
            Arg::F32(v) => (0, v.to_bits() as u64),
            Arg::F64(v) => (0, v.to_bits()),
        };
        let mut out = [0u8; ARG_SIZE];
        out[0] = self.tag();
        out[4..8].copy_from_slice(&aux.to_le_bytes());
        out[8..16].copy_from_slice(&payload.to_le_bytes());
        out
    }

    /// Parses one encoded value. Returns `None` for unused slots, unknown
    /// tags and malformed inline lengths.
    pub fn decode(raw: &[u8; ARG_SIZE]) -> Option<Arg> {
        let mut aux = [0u8; 4];
        aux.copy_from_slice(&raw[4..8]);
        let aux = u32::from_le_bytes(aux);
        let mut payload = [0u8; 8];
        payload.copy_from_slice(&raw[8..16]);
        let bytes = payload;
        let payload = u64::from_le_bytes(payload);

        let arg = match raw[0] {
            TERMINATOR_TAG => Arg::Terminator,
            TIMESTAMP_TAG => Arg::Timestamp(payload),
            3 => Arg::Hash(payload),
            4 => Arg::ErrorCode(payload),
            5 => Arg::Interned {
                len: aux,
                offset: payload,
            },
            6 if aux as usize <= INLINE_CAPACITY => Arg::Inline {
                len: aux as u8,
                bytes,
            },
            7 => Arg::U8(payload as u8),
            8 => Arg::I8(payload as i8),
            9 => Arg::U16(payload as u16),
            10 => Arg::I16(payload as i16),
            11 => Arg::U32(payload as u32),
            12 => Arg::I32(payload as i32),
            13 => Arg::U64(payload),
            14 => Arg::I64(payload as i64),
            15 => Arg::F32(f32::from_bits(payload as u32)),
            16 => Arg::F64(f64::from_bits(payload)),
            _ => return None,
        };
        Some(arg)
    }
}

/// Conversion of a call-site value into an [`Arg`].
///
/// The set of implementors is closed: passing any other type to the logging
/// macros fails to compile. Runtime strings go through the sink's string
/// interning path; everything else is copied.
pub trait ToArg {
    fn to_arg<S: Sink + ?Sized>(&self, sink: &S) -> Result<Arg>;
}

/// Conversion of a literal token, used by the macros for `literal` arguments.
///
/// String literals never touch the strings file: they are inlined or hashed
/// by [`Arg::from_literal`].
pub trait LiteralArg {
    fn literal_arg(self) -> Arg;
}

macro_rules! copy_args {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl ToArg for $ty {
                #[inline(always)]
                fn to_arg<S: Sink + ?Sized>(&self, _sink: &S) -> Result<Arg> {
                    Ok(Arg::$variant(*self))
                }
            }

            impl LiteralArg for $ty {
                #[inline(always)]
                fn literal_arg(self) -> Arg {
                    Arg::$variant(self)
                }
            }
        )*
    };
}

copy_args! {
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    u64 => U64,
    i64 => I64,
    f32 => F32,
    f64 => F64,
}

impl ToArg for usize {
    #[inline(always)]
    fn to_arg<S: Sink + ?Sized>(&self, _sink: &S) -> Result<Arg> {
        Ok(Arg::U64(*self as u64))
    }
}

impl LiteralArg for usize {
    #[inline(always)]
    fn literal_arg(self) -> Arg {
        Arg::U64(self as u64)
    }
}

impl ToArg for isize {
    #[inline(always)]
    fn to_arg<S: Sink + ?Sized>(&self, _sink: &S) -> Result<Arg> {
        Ok(Arg::I64(*self as i64))
    }
}

impl LiteralArg for isize {
    #[inline(always)]
    fn literal_arg(self) -> Arg {
        Arg::I64(self as i64)
    }
}

impl LiteralArg for &'static str {
    #[inline(always)]
    fn literal_arg(self) -> Arg {
        Arg::from_literal(self)
    }
}

impl ToArg for str {
    #[inline]
    fn to_arg<S: Sink + ?Sized>(&self, sink: &S) -> Result<Arg> {
        sink.intern(self.as_bytes())
    }
}

impl ToArg for String {
    #[inline]
    fn to_arg<S: Sink + ?Sized>(&self, sink: &S) -> Result<Arg> {
        sink.intern(self.as_bytes())
    }
}

impl ToArg for ErrorCode {
    #[inline(always)]
    fn to_arg<S: Sink + ?Sized>(&self, _sink: &S) -> Result<Arg> {
        Ok(Arg::ErrorCode(self.0))
    }
}

impl ToArg for SystemTime {
    fn to_arg<S: Sink + ?Sized>(&self, _sink: &S) -> Result<Arg> {
        let nanos = self
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        Ok(Arg::Timestamp(nanos))
    }
}

impl ToArg for Arg {
    #[inline(always)]
    fn to_arg<S: Sink + ?Sized>(&self, _sink: &S) -> Result<Arg> {
        Ok(*self)
    }
}

impl<T: ToArg + ?Sized> ToArg for &T {
    #[inline(always)]
    fn to_arg<S: Sink + ?Sized>(&self, sink: &S) -> Result<Arg> {
        (**self).to_arg(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1_known_vectors() {
        assert_eq!(fnv1_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1_64(b"a"), 0xaf63_bd4c_8601_b7be);
        assert_eq!(fnv1_64(b"foobar"), 0x340d_8765_a4dd_a9c2);
    }

    #[test]
    fn literal_fits_inline_up_to_a_word() {
        let arg = Arg::from_literal("12345678");
        assert_eq!(arg.inline_str(), Some("12345678"));
        let arg = Arg::from_literal("123456789");
        assert_eq!(arg, Arg::Hash(fnv1_64(b"123456789")));
        assert_eq!(Arg::from_literal("").inline_str(), Some(""));
    }

    #[test]
    fn literal_is_const_evaluable() {
        const HASHED: Arg = Arg::from_literal("connection reset by peer");
        assert_eq!(HASHED, Arg::Hash(fnv1_64(b"connection reset by peer")));
    }

    #[test]
    fn wire_layout() {
        let raw = Arg::Interned { len: 300, offset: 0x1_0000 }.encode();
        assert_eq!(raw[0], 5);
        assert_eq!(&raw[1..4], &[0, 0, 0]);
        assert_eq!(u32::from_le_bytes(raw[4..8].try_into().unwrap()), 300);
        assert_eq!(u64::from_le_bytes(raw[8..16].try_into().unwrap()), 0x1_0000);

        let raw = Arg::Terminator.encode();
        assert_eq!(raw, [1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn signed_and_float_values_survive_decoding() {
        for arg in [Arg::I8(-3), Arg::I16(-300), Arg::I32(i32::MIN), Arg::F32(-1.5), Arg::F64(2.25)] {
            assert_eq!(Arg::decode(&arg.encode()), Some(arg));
        }
    }

    #[test]
    fn unused_and_unknown_tags_do_not_decode() {
        assert_eq!(Arg::decode(&[0u8; ARG_SIZE]), None);
        let mut raw = [0u8; ARG_SIZE];
        raw[0] = 99;
        assert_eq!(Arg::decode(&raw), None);
        raw[0] = 6;
        raw[4] = 9;
        assert_eq!(Arg::decode(&raw), None, "inline length above capacity");
    }
}
