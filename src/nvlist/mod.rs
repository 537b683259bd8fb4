//! Codec for the kernel's self-describing name/value list format.
//!
//! A serialized nvlist is a 4-byte stream header (encoding, endianness, two
//! reserved bytes), an 8-byte list header (version, flags), a sequence of
//! size-prefixed pairs and a 4-byte zero terminator. Embedded nvlists carry
//! a full in-memory `nvlist_t` block (24 bytes) inside their pair and stream
//! their own pairs right after it.
//!
//! Writing always produces the native encoding in little endian with the
//! unique-name flag set. Reading accepts native and XDR buffers in either
//! endianness; XDR differs by a 4-byte alignment, an extra ignored
//! decoded-size word per pair and nothing else we care about.

mod decode;
mod encode;
mod value;

pub use decode::unpack;
pub use encode::pack;
pub use value::{FromNvlist, NvList, ToNvlist, Value};
pub(crate) use value::unknown_field;

use crate::error::Error;

pub(crate) const ENCODING_NATIVE: u8 = 0x00;
pub(crate) const ENCODING_XDR: u8 = 0x01;
pub(crate) const ENDIAN_BIG: u8 = 0x00;
pub(crate) const ENDIAN_LITTLE: u8 = 0x01;

/// `NV_UNIQUE_NAME`, set on every list we emit.
pub(crate) const UNIQUE_NAME_FLAG: u32 = 0x01;

/// Size of the `nvpair_t` header: size, name length, reserve, element
/// count, tag.
pub(crate) const PAIR_HEADER_SIZE: usize = 16;

/// Size of the embedded `nvlist_t` block carried by nvlist-valued pairs.
pub(crate) const EMBEDDED_LIST_HEADER_SIZE: usize = 24;

/// Defensive upper bound on per-pair element counts.
pub(crate) const MAX_ELEMENTS: i32 = 65535;

/// The kernel's `data_type_t` tag table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum Tag {
    Boolean = 1,
    Byte = 2,
    Int16 = 3,
    Uint16 = 4,
    Int32 = 5,
    Uint32 = 6,
    Int64 = 7,
    Uint64 = 8,
    String = 9,
    ByteArray = 10,
    Int16Array = 11,
    Uint16Array = 12,
    Int32Array = 13,
    Uint32Array = 14,
    Int64Array = 15,
    Uint64Array = 16,
    StringArray = 17,
    Hrtime = 18,
    Nvlist = 19,
    NvlistArray = 20,
    BooleanValue = 21,
    Int8 = 22,
    Uint8 = 23,
    BooleanArray = 24,
    Int8Array = 25,
    Uint8Array = 26,
    Double = 27,
}

impl Tag {
    pub(crate) fn from_raw(raw: u32) -> Result<Tag, Error> {
        Ok(match raw {
            1 => Tag::Boolean,
            2 => Tag::Byte,
            3 => Tag::Int16,
            4 => Tag::Uint16,
            5 => Tag::Int32,
            6 => Tag::Uint32,
            7 => Tag::Int64,
            8 => Tag::Uint64,
            9 => Tag::String,
            10 => Tag::ByteArray,
            11 => Tag::Int16Array,
            12 => Tag::Uint16Array,
            13 => Tag::Int32Array,
            14 => Tag::Uint32Array,
            15 => Tag::Int64Array,
            16 => Tag::Uint64Array,
            17 => Tag::StringArray,
            18 => Tag::Hrtime,
            19 => Tag::Nvlist,
            20 => Tag::NvlistArray,
            21 => Tag::BooleanValue,
            22 => Tag::Int8,
            23 => Tag::Uint8,
            24 => Tag::BooleanArray,
            25 => Tag::Int8Array,
            26 => Tag::Uint8Array,
            27 => Tag::Double,
            _ => return Err(Error::InvalidData),
        })
    }
}
