use crate::error::{Error, Result};

use super::value::{NvList, Value};
use super::{Tag, ENCODING_NATIVE, ENCODING_XDR, ENDIAN_BIG, ENDIAN_LITTLE, MAX_ELEMENTS};

/// Parses a serialized nvlist in native or XDR encoding, either endianness.
pub fn unpack(data: &[u8]) -> Result<NvList> {
    let mut r = ListReader::new(data)?;
    let mut out = NvList::new();
    r.read_pairs(&mut out)?;
    Ok(out)
}

struct ListReader<'a> {
    data: &'a [u8],
    pos: usize,
    big_endian: bool,
    xdr: bool,
}

impl<'a> ListReader<'a> {
    fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < 12 {
            return Err(Error::InvalidData);
        }
        let xdr = match data[0] {
            ENCODING_NATIVE => false,
            ENCODING_XDR => true,
            _ => return Err(Error::InvalidEncoding),
        };
        let big_endian = match data[1] {
            ENDIAN_BIG => true,
            ENDIAN_LITTLE => false,
            _ => return Err(Error::InvalidEndianness),
        };
        // Bytes 2..4 are reserved, 4..12 carry the list version and flags;
        // neither changes how the pairs decode.
        Ok(Self {
            data,
            pos: 12,
            big_endian,
            xdr,
        })
    }

    fn read_size(&mut self) -> Result<i32> {
        let bytes: [u8; 4] = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or(Error::InvalidData)?
            .try_into()
            .unwrap();
        self.pos += 4;
        Ok(if self.big_endian {
            i32::from_be_bytes(bytes)
        } else {
            i32::from_le_bytes(bytes)
        })
    }

    /// Reads pairs into `out` until the zero terminator. Embedded lists
    /// stream their pairs after the pair record that announced them, so
    /// this recurses on the same cursor.
    fn read_pairs(&mut self, out: &mut NvList) -> Result<()> {
        let data = self.data;
        loop {
            let pair_start = self.pos;
            let size = self.read_size()?;
            if size == 0 {
                return Ok(());
            }
            if size < 0 || pair_start + size as usize > data.len() {
                return Err(Error::InvalidData);
            }

            let mut pr = PairReader {
                data: &data[pair_start..pair_start + size as usize],
                pos: 4,
                big_endian: self.big_endian,
                align: if self.xdr { 4 } else { 8 },
            };
            self.pos = pair_start + size as usize;

            if self.xdr {
                // Decoded (in-memory) size, irrelevant to us.
                pr.skip(4)?;
            }

            let name_sz = pr.read_i16()?;
            if name_sz <= 0 {
                return Err(Error::InvalidData);
            }
            let _reserve = pr.read_i16()?;
            let elems = pr.read_i32()?;
            if elems < 0 || elems > MAX_ELEMENTS {
                return Err(Error::InvalidData);
            }
            let tag = Tag::from_raw(pr.read_u32()?)?;

            let name_raw = pr.take(name_sz as usize)?;
            if name_raw.last() != Some(&0) {
                return Err(Error::InvalidData);
            }
            let name = std::str::from_utf8(&name_raw[..name_raw.len() - 1])
                .map_err(|_| Error::InvalidData)?
                .to_owned();

            pr.align_to_payload();

            let value = self.read_value(&mut pr, tag, elems as usize)?;
            out.insert(name, value);
        }
    }

    fn read_value(&mut self, pr: &mut PairReader<'_>, tag: Tag, elems: usize) -> Result<Value> {
        Ok(match tag {
            Tag::Boolean => Value::Bool(true),
            Tag::BooleanValue => match pr.read_i32()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                _ => return Err(Error::InvalidData),
            },
            Tag::Byte => Value::Byte(pr.read_u8()?),
            Tag::Int8 => Value::Int8(pr.read_u8()? as i8),
            Tag::Uint8 => Value::Uint8(pr.read_u8()?),
            Tag::Int16 => Value::Int16(pr.read_i16()?),
            Tag::Uint16 => Value::Uint16(pr.read_u16()?),
            Tag::Int32 => Value::Int32(pr.read_i32()?),
            Tag::Uint32 => Value::Uint32(pr.read_u32()?),
            Tag::Int64 => Value::Int64(pr.read_i64()?),
            Tag::Uint64 => Value::Uint64(pr.read_u64()?),
            Tag::Double => Value::Double(f64::from_bits(pr.read_u64()?)),
            Tag::String => Value::Str(pr.read_cstr()?),
            Tag::ByteArray => Value::ByteArray(pr.take(elems)?.to_vec()),
            Tag::Int8Array => {
                Value::Int8Array(pr.take(elems)?.iter().map(|b| *b as i8).collect())
            }
            Tag::Uint8Array => Value::Uint8Array(pr.take(elems)?.to_vec()),
            Tag::Int16Array => {
                let mut v = Vec::with_capacity(elems);
                for _ in 0..elems {
                    v.push(pr.read_i16()?);
                }
                Value::Int16Array(v)
            }
            Tag::Uint16Array => {
                let mut v = Vec::with_capacity(elems);
                for _ in 0..elems {
                    v.push(pr.read_u16()?);
                }
                Value::Uint16Array(v)
            }
            Tag::Int32Array => {
                let mut v = Vec::with_capacity(elems);
                for _ in 0..elems {
                    v.push(pr.read_i32()?);
                }
                Value::Int32Array(v)
            }
            Tag::Uint32Array => {
                let mut v = Vec::with_capacity(elems);
                for _ in 0..elems {
                    v.push(pr.read_u32()?);
                }
                Value::Uint32Array(v)
            }
            Tag::Int64Array => {
                let mut v = Vec::with_capacity(elems);
                for _ in 0..elems {
                    v.push(pr.read_i64()?);
                }
                Value::Int64Array(v)
            }
            Tag::Uint64Array => {
                let mut v = Vec::with_capacity(elems);
                for _ in 0..elems {
                    v.push(pr.read_u64()?);
                }
                Value::Uint64Array(v)
            }
            Tag::BooleanArray => {
                let mut v = Vec::with_capacity(elems);
                for _ in 0..elems {
                    v.push(match pr.read_i32()? {
                        0 => false,
                        1 => true,
                        _ => return Err(Error::InvalidData),
                    });
                }
                Value::BoolArray(v)
            }
            Tag::StringArray => {
                // Placeholder pointer block, one word per element.
                pr.skip(8 * elems)?;
                let mut v = Vec::with_capacity(elems);
                for _ in 0..elems {
                    v.push(pr.read_cstr()?);
                }
                Value::StrArray(v)
            }
            Tag::Nvlist => {
                // The pair itself only carries the embedded list header;
                // the inner pairs follow on the outer cursor.
                let mut inner = NvList::new();
                self.read_pairs(&mut inner)?;
                Value::List(inner)
            }
            Tag::NvlistArray => {
                let mut v = Vec::with_capacity(elems);
                for _ in 0..elems {
                    let mut inner = NvList::new();
                    self.read_pairs(&mut inner)?;
                    v.push(inner);
                }
                Value::ListArray(v)
            }
            Tag::Hrtime => return Err(Error::UnsupportedType),
        })
    }
}

/// Bounded reader over a single pair record. Offsets (and therefore
/// payload alignment) are relative to the pair's own start.
struct PairReader<'a> {
    data: &'a [u8],
    pos: usize,
    big_endian: bool,
    align: usize,
}

impl<'a> PairReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let data = self.data;
        let out = data
            .get(self.pos..self.pos + n)
            .ok_or(Error::InvalidData)?;
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        if self.pos + n > self.data.len() {
            return Err(Error::InvalidData);
        }
        self.pos += n;
        Ok(())
    }

    fn align_to_payload(&mut self) {
        let off = self.pos % self.align;
        if off != 0 {
            self.pos += self.align - off;
        }
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_cstr(&mut self) -> Result<String> {
        let data = self.data;
        let rest = data.get(self.pos..).ok_or(Error::InvalidData)?;
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(Error::InvalidData)?;
        self.pos += nul + 1;
        std::str::from_utf8(&rest[..nul])
            .map(str::to_owned)
            .map_err(|_| Error::InvalidData)
    }
}

macro_rules! pair_reader_ints {
    ($($fn_name:ident => $ty:ty),* $(,)?) => {
        impl<'a> PairReader<'a> {
            $(fn $fn_name(&mut self) -> Result<$ty> {
                let bytes: [u8; std::mem::size_of::<$ty>()] =
                    self.take(std::mem::size_of::<$ty>())?.try_into().unwrap();
                Ok(if self.big_endian {
                    <$ty>::from_be_bytes(bytes)
                } else {
                    <$ty>::from_le_bytes(bytes)
                })
            })*
        }
    };
}

pair_reader_ints! {
    read_i16 => i16,
    read_u16 => u16,
    read_i32 => i32,
    read_u32 => u32,
    read_i64 => i64,
    read_u64 => u64,
}

#[cfg(test)]
mod tests {
    use super::super::pack;
    use super::*;

    fn sample() -> NvList {
        let mut vdev = NvList::new();
        vdev.insert("type", "file");
        vdev.insert("path", "/tmp/zdev0");
        vdev.insert("is_log", 0u64);

        let mut nv = NvList::new();
        nv.insert("present", true);
        nv.insert("byte", 0x5au8);
        nv.insert("i8", -3i8);
        nv.insert("i16", -1234i16);
        nv.insert("u16", 0xbeefu16);
        nv.insert("i32", -7i32);
        nv.insert("u32", 0xdead_beefu32);
        nv.insert("i64", i64::MIN + 1);
        nv.insert("u64", u64::MAX);
        nv.insert("ratio", 1.25f64);
        nv.insert("name", "tank/fs@snap");
        nv.insert("bytes", vec![1u8, 2, 3, 4, 5]);
        nv.insert("shorts", vec![-1i16, 0, 1]);
        nv.insert("longs", vec![1u64, 2, 3]);
        nv.insert("flags", vec![true, false, true]);
        nv.insert("names", vec!["a".to_owned(), "bc".to_owned(), "def".to_owned()]);
        nv.insert("vdev_tree", vdev.clone());
        nv.insert("children", vec![vdev.clone(), vdev]);
        nv
    }

    #[test]
    fn round_trip_generic() {
        let nv = sample();
        let first = unpack(&pack(&nv).unwrap()).unwrap();
        assert_eq!(first, nv);
        // Re-encoding a decoded list must decode back to the same value;
        // the bytes may differ (placeholder regions, pair order).
        let second = unpack(&pack(&first).unwrap()).unwrap();
        assert_eq!(second, first);
    }

    #[test]
    fn nested_list_round_trip() {
        let mut inner = NvList::new();
        inner.insert("space", 4096u64);
        let mut mid = NvList::new();
        mid.insert("inner", inner);
        mid.insert("after", 1u32);
        let mut nv = NvList::new();
        nv.insert("mid", mid);
        nv.insert("tail", "end");
        assert_eq!(unpack(&pack(&nv).unwrap()).unwrap(), nv);
    }

    // Builds a single-pair native little-endian stream by hand, so tests
    // can place tags and payloads the encoder would never produce.
    fn raw_pair(name: &[u8], elems: i32, tag: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8, 1, 0, 0];
        buf.extend_from_slice(&0i32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());

        let header_and_name = 16 + name.len();
        let payload_at = header_and_name.div_ceil(8) * 8;
        let size = (payload_at + payload.len()).div_ceil(8) * 8;

        let pair_start = buf.len();
        buf.extend_from_slice(&(size as i32).to_le_bytes());
        buf.extend_from_slice(&(name.len() as i16).to_le_bytes());
        buf.extend_from_slice(&0i16.to_le_bytes());
        buf.extend_from_slice(&elems.to_le_bytes());
        buf.extend_from_slice(&tag.to_le_bytes());
        buf.extend_from_slice(name);
        buf.resize(pair_start + payload_at, 0);
        buf.extend_from_slice(payload);
        buf.resize(pair_start + size, 0);

        buf.extend_from_slice(&[0; 4]); // terminator
        buf
    }

    #[test]
    fn boolean_value_pairs() {
        let t = raw_pair(b"b\0", 1, 21, &1i32.to_le_bytes());
        assert_eq!(unpack(&t).unwrap().get("b"), Some(&Value::Bool(true)));

        let f = raw_pair(b"b\0", 1, 21, &0i32.to_le_bytes());
        assert_eq!(unpack(&f).unwrap().get("b"), Some(&Value::Bool(false)));

        let bad = raw_pair(b"b\0", 1, 21, &2i32.to_le_bytes());
        assert!(matches!(unpack(&bad), Err(Error::InvalidData)));
    }

    #[test]
    fn big_endian_native_read() {
        let mut buf = vec![0u8, 0, 0, 0]; // native, big endian
        buf.extend_from_slice(&0i32.to_be_bytes());
        buf.extend_from_slice(&1u32.to_be_bytes());
        // pair: header 16 + "g\0" = 18, payload at 24, u64 ends at 32
        buf.extend_from_slice(&32i32.to_be_bytes());
        buf.extend_from_slice(&2i16.to_be_bytes());
        buf.extend_from_slice(&0i16.to_be_bytes());
        buf.extend_from_slice(&1i32.to_be_bytes());
        buf.extend_from_slice(&8u32.to_be_bytes()); // uint64
        buf.extend_from_slice(b"g\0");
        buf.extend_from_slice(&[0; 6]);
        buf.extend_from_slice(&0x1122_3344_5566_7788u64.to_be_bytes());
        buf.extend_from_slice(&[0; 4]);

        let nv = unpack(&buf).unwrap();
        assert_eq!(nv.get_u64("g"), Some(0x1122_3344_5566_7788));
    }

    #[test]
    fn xdr_read() {
        let mut buf = vec![1u8, 1, 0, 0]; // xdr, little endian
        buf.extend_from_slice(&0i32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        // pair: size 4 + decoded 4 + header 12 + "n\0" = 22, payload at 24
        // (4-byte alignment), u32 ends at 28
        buf.extend_from_slice(&28i32.to_le_bytes());
        buf.extend_from_slice(&24i32.to_le_bytes()); // decoded size, ignored
        buf.extend_from_slice(&2i16.to_le_bytes());
        buf.extend_from_slice(&0i16.to_le_bytes());
        buf.extend_from_slice(&1i32.to_le_bytes());
        buf.extend_from_slice(&6u32.to_le_bytes()); // uint32
        buf.extend_from_slice(b"n\0");
        buf.extend_from_slice(&[0; 2]);
        buf.extend_from_slice(&0xdead_beefu32.to_le_bytes());
        buf.extend_from_slice(&[0; 4]);

        let nv = unpack(&buf).unwrap();
        assert_eq!(nv.get("n"), Some(&Value::Uint32(0xdead_beef)));
    }

    #[test]
    fn header_rejection() {
        assert!(matches!(
            unpack(&[7, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(Error::InvalidEncoding)
        ));
        assert!(matches!(
            unpack(&[0, 9, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(Error::InvalidEndianness)
        ));
        assert!(matches!(unpack(&[0, 1, 0]), Err(Error::InvalidData)));
    }

    #[test]
    fn pair_rejection() {
        let mut nv = NvList::new();
        nv.insert("a", 7u64);
        let good = pack(&nv).unwrap();
        // offsets within the first pair: size@12, name_sz@16, elems@20, tag@24
        assert!(unpack(&good).is_ok());

        let mut negative_size = good.clone();
        negative_size[12..16].copy_from_slice(&(-8i32).to_le_bytes());
        assert!(matches!(unpack(&negative_size), Err(Error::InvalidData)));

        let mut overrun_size = good.clone();
        overrun_size[12..16].copy_from_slice(&4096i32.to_le_bytes());
        assert!(matches!(unpack(&overrun_size), Err(Error::InvalidData)));

        let mut zero_name = good.clone();
        zero_name[16..18].copy_from_slice(&0i16.to_le_bytes());
        assert!(matches!(unpack(&zero_name), Err(Error::InvalidData)));

        let mut huge_count = good.clone();
        huge_count[20..24].copy_from_slice(&70_000i32.to_le_bytes());
        assert!(matches!(unpack(&huge_count), Err(Error::InvalidData)));

        let mut negative_count = good.clone();
        negative_count[20..24].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(unpack(&negative_count), Err(Error::InvalidData)));

        let mut unknown_tag = good.clone();
        unknown_tag[24..28].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(unpack(&unknown_tag), Err(Error::InvalidData)));

        let mut hrtime_tag = good;
        hrtime_tag[24..28].copy_from_slice(&18u32.to_le_bytes());
        assert!(matches!(unpack(&hrtime_tag), Err(Error::UnsupportedType)));
    }

    #[test]
    fn unterminated_name_is_rejected() {
        let buf = raw_pair(b"xy", 1, 5, &1i32.to_le_bytes());
        assert!(matches!(unpack(&buf), Err(Error::InvalidData)));
    }

    #[test]
    fn string_arrays_keep_empty_elements() {
        let mut nv = NvList::new();
        nv.insert(
            "names",
            vec!["".to_owned(), "mid".to_owned(), "".to_owned()],
        );
        assert_eq!(unpack(&pack(&nv).unwrap()).unwrap(), nv);
    }

    #[test]
    fn byte_and_uint8_arrays_stay_distinct() {
        let mut nv = NvList::new();
        nv.insert("raw", Value::ByteArray(vec![1, 2, 3]));
        nv.insert("u8s", Value::Uint8Array(vec![1, 2, 3]));
        let decoded = unpack(&pack(&nv).unwrap()).unwrap();
        assert_eq!(decoded.get("raw"), Some(&Value::ByteArray(vec![1, 2, 3])));
        assert_eq!(decoded.get("u8s"), Some(&Value::Uint8Array(vec![1, 2, 3])));
    }

    #[test]
    fn empty_nested_lists_round_trip() {
        let mut nv = NvList::new();
        nv.insert("empty", NvList::new());
        nv.insert("empties", vec![NvList::new(), NvList::new()]);
        assert_eq!(unpack(&pack(&nv).unwrap()).unwrap(), nv);
    }

    #[test]
    fn lists_nested_inside_list_arrays_round_trip() {
        let mut leaf = NvList::new();
        leaf.insert("guid", 7u64);
        let mut child = NvList::new();
        child.insert("children", vec![leaf.clone(), leaf]);
        let mut nv = NvList::new();
        nv.insert("vdev_tree", child);
        assert_eq!(unpack(&pack(&nv).unwrap()).unwrap(), nv);
    }

    // Decoding must reject, never panic, whatever prefix of a valid
    // buffer it is handed.
    #[test]
    fn truncated_inputs_never_panic() {
        let nv = sample();
        let buf = pack(&nv).unwrap();
        for len in 0..buf.len() {
            let _ = unpack(&buf[..len]);
        }
    }
}
