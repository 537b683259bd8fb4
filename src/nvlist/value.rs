use std::collections::btree_map;
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A dynamically typed nvlist value.
///
/// Every tag the wire format distinguishes keeps its own variant so a
/// decoded buffer re-encodes without losing type information. `Byte` and
/// `Uint8` (and their array forms) are distinct kinds on the wire even
/// though both carry `u8`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Booleans follow the presence convention on the wire: `Bool(true)`
    /// encodes as a payload-less presence pair, `Bool(false)` is skipped
    /// entirely. Decoding a boolean-value pair also lands here.
    Bool(bool),
    Byte(u8),
    Int8(i8),
    Uint8(u8),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Str(String),
    ByteArray(Vec<u8>),
    Int8Array(Vec<i8>),
    Uint8Array(Vec<u8>),
    Int16Array(Vec<i16>),
    Uint16Array(Vec<u16>),
    Int32Array(Vec<i32>),
    Uint32Array(Vec<u32>),
    Int64Array(Vec<i64>),
    Uint64Array(Vec<u64>),
    BoolArray(Vec<bool>),
    StrArray(Vec<String>),
    List(NvList),
    ListArray(Vec<NvList>),
}

/// A name/value mapping with unique keys, the tree the codec encodes and
/// decodes. Keys are kept sorted; the wire format does not promise any
/// pair order and the kernel does not care.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NvList {
    entries: BTreeMap<String, Value>,
}

impl NvList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.entries.iter()
    }

    /// Presence convention: an absent name reads as false.
    pub fn get_bool(&self, name: &str) -> bool {
        matches!(self.get(name), Some(Value::Bool(true)))
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        match self.get(name) {
            Some(Value::Uint64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i32(&self, name: &str) -> Option<i32> {
        match self.get(name) {
            Some(Value::Int32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Value::Str(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_list(&self, name: &str) -> Option<&NvList> {
        match self.get(name) {
            Some(Value::List(v)) => Some(v),
            _ => None,
        }
    }
}

impl<'a> IntoIterator for &'a NvList {
    type Item = (&'a String, &'a Value);
    type IntoIter = btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl IntoIterator for NvList {
    type Item = (String, Value);
    type IntoIter = btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<N: Into<String>, V: Into<Value>> FromIterator<(N, V)> for NvList {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut nv = NvList::new();
        for (name, value) in iter {
            nv.insert(name, value);
        }
        nv
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Value {
                Value::$variant(v)
            }
        })*
    };
}

// u8 maps to the byte kind, matching what the kernel emits for raw octets.
value_from! {
    bool => Bool,
    u8 => Byte,
    i8 => Int8,
    i16 => Int16,
    u16 => Uint16,
    i32 => Int32,
    u32 => Uint32,
    i64 => Int64,
    u64 => Uint64,
    f64 => Double,
    String => Str,
    Vec<u8> => ByteArray,
    Vec<i8> => Int8Array,
    Vec<i16> => Int16Array,
    Vec<u16> => Uint16Array,
    Vec<i32> => Int32Array,
    Vec<u32> => Uint32Array,
    Vec<i64> => Int64Array,
    Vec<u64> => Uint64Array,
    Vec<bool> => BoolArray,
    Vec<String> => StrArray,
    NvList => List,
    Vec<NvList> => ListArray,
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_owned())
    }
}

impl From<&[&str]> for Value {
    fn from(v: &[&str]) -> Value {
        Value::StrArray(v.iter().map(|s| (*s).to_owned()).collect())
    }
}

/// Serialization side of the typed-record path. Implementations decide
/// field order and skip read-only fields, omit-empty fields holding the
/// zero of their kind, and false booleans.
pub trait ToNvlist {
    fn to_nvlist(&self) -> Result<NvList>;
}

impl ToNvlist for NvList {
    fn to_nvlist(&self) -> Result<NvList> {
        Ok(self.clone())
    }
}

/// Deserialization side of the typed-record path. Implementations must
/// reject pair names outside their schema with [`Error::InvalidValue`];
/// absent names materialize as the field's default.
pub trait FromNvlist: Sized {
    fn from_nvlist(nv: &NvList) -> Result<Self>;
}

impl FromNvlist for NvList {
    fn from_nvlist(nv: &NvList) -> Result<Self> {
        Ok(nv.clone())
    }
}

pub(crate) fn unknown_field(_name: &str) -> Error {
    Error::InvalidValue("pair name not in the record schema")
}
