use crate::error::{Error, Result};

use super::value::{NvList, Value};
use super::{
    Tag, EMBEDDED_LIST_HEADER_SIZE, ENCODING_NATIVE, ENDIAN_LITTLE, PAIR_HEADER_SIZE,
    UNIQUE_NAME_FLAG,
};

/// Serializes a list into the native encoding, little endian, with the
/// unique-name flag set. This is the only write mode the kernel interface
/// needs; XDR stays read-only.
pub fn pack(nv: &NvList) -> Result<Vec<u8>> {
    let mut w = Writer {
        buf: Vec::with_capacity(256),
        pair_start: 0,
    };
    w.stream_header();
    w.write_pairs(nv)?;
    Ok(w.buf)
}

struct Writer {
    buf: Vec<u8>,
    // Start offset of the pair currently being written; pair padding is
    // relative to this, not to the buffer.
    pair_start: usize,
}

impl Writer {
    fn stream_header(&mut self) {
        self.buf.push(ENCODING_NATIVE);
        self.buf.push(ENDIAN_LITTLE);
        self.zeros(2); // reserved
        self.put_i32(0); // version
        self.put_u32(UNIQUE_NAME_FLAG);
    }

    fn zeros(&mut self, n: usize) {
        self.buf.resize(self.buf.len() + n, 0);
    }

    fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_cstr(&mut self, s: &str) -> Result<()> {
        if s.as_bytes().contains(&0) {
            return Err(Error::InvalidValue("string contains a null byte"));
        }
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    fn pad_pair(&mut self) {
        let off = (self.buf.len() - self.pair_start) % 8;
        if off != 0 {
            self.zeros(8 - off);
        }
    }

    fn begin_pair(&mut self) {
        self.pair_start = self.buf.len();
        self.zeros(PAIR_HEADER_SIZE);
    }

    /// Pads the pair to its 8-byte boundary and backfills the header now
    /// that the total size is known.
    fn end_pair(&mut self, name_len: i16, elems: i32, tag: Tag) {
        self.pad_pair();
        let size = (self.buf.len() - self.pair_start) as i32;
        let header = &mut self.buf[self.pair_start..self.pair_start + PAIR_HEADER_SIZE];
        header[0..4].copy_from_slice(&size.to_le_bytes());
        header[4..6].copy_from_slice(&name_len.to_le_bytes());
        // 6..8 is the reserve field, already zero.
        header[8..12].copy_from_slice(&elems.to_le_bytes());
        header[12..16].copy_from_slice(&(tag as u32).to_le_bytes());
    }

    /// The in-memory `nvlist_t` block embedded in nvlist-valued pairs.
    /// Only version and flags mean anything in the serialized form; the
    /// pointer words are written as zero and ignored by every reader.
    fn embedded_list_header(&mut self) {
        self.put_i32(0); // version
        self.put_u32(UNIQUE_NAME_FLAG);
        self.zeros(EMBEDDED_LIST_HEADER_SIZE - 8); // priv, flag, pad
    }

    fn write_pairs(&mut self, nv: &NvList) -> Result<()> {
        for (name, value) in nv {
            // Presence convention: false is expressed by not writing the
            // pair at all.
            if matches!(value, Value::Bool(false)) {
                continue;
            }

            let name_len = name.len() + 1;
            if name_len >= i16::MAX as usize {
                return Err(Error::InvalidValue("pair name too long"));
            }
            let name_len = name_len as i16;

            self.begin_pair();
            self.put_cstr(name)?;
            self.pad_pair();

            match value {
                Value::List(inner) => {
                    self.embedded_list_header();
                    self.end_pair(name_len, 1, Tag::Nvlist);
                    // The nested pair stream follows the pair record and
                    // brings its own zero terminator.
                    self.write_pairs(inner)?;
                }
                Value::ListArray(lists) => {
                    let elems = array_len(lists.len())?;
                    self.zeros(8 * lists.len()); // placeholder pointers
                    for _ in lists {
                        self.embedded_list_header();
                    }
                    self.end_pair(name_len, elems, Tag::NvlistArray);
                    for inner in lists {
                        self.write_pairs(inner)?;
                    }
                }
                other => {
                    let (tag, elems) = self.put_payload(other)?;
                    self.end_pair(name_len, elems, tag);
                }
            }
        }
        self.zeros(4); // list terminator
        Ok(())
    }

    fn put_payload(&mut self, value: &Value) -> Result<(Tag, i32)> {
        Ok(match value {
            Value::Bool(true) => (Tag::Boolean, 0),
            Value::Byte(v) => {
                self.buf.push(*v);
                (Tag::Byte, 1)
            }
            Value::Int8(v) => {
                self.buf.push(*v as u8);
                (Tag::Int8, 1)
            }
            Value::Uint8(v) => {
                self.buf.push(*v);
                (Tag::Uint8, 1)
            }
            Value::Int16(v) => {
                self.buf.extend_from_slice(&v.to_le_bytes());
                (Tag::Int16, 1)
            }
            Value::Uint16(v) => {
                self.buf.extend_from_slice(&v.to_le_bytes());
                (Tag::Uint16, 1)
            }
            Value::Int32(v) => {
                self.buf.extend_from_slice(&v.to_le_bytes());
                (Tag::Int32, 1)
            }
            Value::Uint32(v) => {
                self.buf.extend_from_slice(&v.to_le_bytes());
                (Tag::Uint32, 1)
            }
            Value::Int64(v) => {
                self.buf.extend_from_slice(&v.to_le_bytes());
                (Tag::Int64, 1)
            }
            Value::Uint64(v) => {
                self.buf.extend_from_slice(&v.to_le_bytes());
                (Tag::Uint64, 1)
            }
            Value::Double(v) => {
                self.buf.extend_from_slice(&v.to_le_bytes());
                (Tag::Double, 1)
            }
            Value::Str(s) => {
                self.put_cstr(s)?;
                (Tag::String, 1)
            }
            Value::ByteArray(v) => {
                self.buf.extend_from_slice(v);
                (Tag::ByteArray, array_len(v.len())?)
            }
            Value::Int8Array(v) => {
                self.buf.extend(v.iter().map(|b| *b as u8));
                (Tag::Int8Array, array_len(v.len())?)
            }
            Value::Uint8Array(v) => {
                self.buf.extend_from_slice(v);
                (Tag::Uint8Array, array_len(v.len())?)
            }
            Value::Int16Array(v) => {
                for e in v {
                    self.buf.extend_from_slice(&e.to_le_bytes());
                }
                (Tag::Int16Array, array_len(v.len())?)
            }
            Value::Uint16Array(v) => {
                for e in v {
                    self.buf.extend_from_slice(&e.to_le_bytes());
                }
                (Tag::Uint16Array, array_len(v.len())?)
            }
            Value::Int32Array(v) => {
                for e in v {
                    self.buf.extend_from_slice(&e.to_le_bytes());
                }
                (Tag::Int32Array, array_len(v.len())?)
            }
            Value::Uint32Array(v) => {
                for e in v {
                    self.buf.extend_from_slice(&e.to_le_bytes());
                }
                (Tag::Uint32Array, array_len(v.len())?)
            }
            Value::Int64Array(v) => {
                for e in v {
                    self.buf.extend_from_slice(&e.to_le_bytes());
                }
                (Tag::Int64Array, array_len(v.len())?)
            }
            Value::Uint64Array(v) => {
                for e in v {
                    self.buf.extend_from_slice(&e.to_le_bytes());
                }
                (Tag::Uint64Array, array_len(v.len())?)
            }
            Value::BoolArray(v) => {
                for e in v {
                    self.put_i32(*e as i32);
                }
                (Tag::BooleanArray, array_len(v.len())?)
            }
            Value::StrArray(v) => {
                self.zeros(8 * v.len()); // placeholder pointers
                for s in v {
                    self.put_cstr(s)?;
                }
                (Tag::StringArray, array_len(v.len())?)
            }
            Value::Bool(false) | Value::List(_) | Value::ListArray(_) => {
                unreachable!("handled by write_pairs")
            }
        })
    }
}

fn array_len(len: usize) -> Result<i32> {
    if len >= i32::MAX as usize {
        return Err(Error::InvalidValue("array has too many elements"));
    }
    Ok(len as i32)
}

#[cfg(test)]
mod tests {
    use super::super::unpack;
    use super::*;

    #[test]
    fn stream_and_list_header() {
        let buf = pack(&NvList::new()).unwrap();
        // encoding, endianness, reserved, version, flags, terminator
        assert_eq!(
            buf,
            [0, 1, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn pairs_are_aligned() {
        let mut nv = NvList::new();
        nv.insert("a", 1u8);
        nv.insert("long-pair-name", 7u64);
        nv.insert("s", "x");
        let buf = pack(&nv).unwrap();

        // Walk the pair stream and check every size is a multiple of 8, so
        // pair starts stay aligned relative to the list.
        let mut pos = 12;
        loop {
            let size = i32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
            if size == 0 {
                break;
            }
            assert_eq!(size % 8, 0, "pair at {pos} has unaligned size {size}");
            pos += size as usize;
        }
    }

    #[test]
    fn false_boolean_is_skipped() {
        let mut nv = NvList::new();
        nv.insert("yes", true);
        nv.insert("no", false);
        let decoded = unpack(&pack(&nv).unwrap()).unwrap();
        assert_eq!(decoded.get("yes"), Some(&Value::Bool(true)));
        assert!(decoded.get("no").is_none());
    }

    #[test]
    fn null_byte_in_name_is_rejected() {
        let mut nv = NvList::new();
        nv.insert("bad\0name", 1u64);
        assert!(matches!(pack(&nv), Err(Error::InvalidValue(_))));
    }

    #[test]
    fn null_byte_in_string_is_rejected() {
        let mut nv = NvList::new();
        nv.insert("s", "a\0b");
        assert!(matches!(pack(&nv), Err(Error::InvalidValue(_))));
    }

    #[test]
    fn overlong_name_is_rejected() {
        let mut nv = NvList::new();
        nv.insert("x".repeat(i16::MAX as usize), 1u64);
        assert!(matches!(pack(&nv), Err(Error::InvalidValue(_))));
    }
}
