//! The pickle wire codec.
//!
//! A pickle is the bin payload carried inside a `MIGRATE` insert or a
//! replicated write: an info byte, a bin count, then each bin as
//! `name_len | name | particle_tag | flags | value_len | value`. A drop
//! pickle (tombstone) has the drop bit set in the info byte and zero bins.
//! A bin count of zero *without* the drop bit is rejected as malformed --
//! a namespace with no bins at all is represented as an explicit delete,
//! never as an empty insert.
//!
//! Bytes/Encoder/Decoder follow the teacher's `tokio_util::codec` usage
//! elsewhere in this stack; the framing here is purpose-built for this
//! wire format rather than reusing `LengthDelimitedCodec`.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use partdb_core::{ParticleType, Value};
use tokio_util::codec::{Decoder, Encoder};

const DROP_BIT: u8 = 0b0000_0001;

/// The bin payload of one record, as carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Pickle {
    Bins(BTreeMap<String, Value>),
    Drop,
}

impl Pickle {
    #[must_use]
    pub fn is_drop(&self) -> bool {
        matches!(self, Pickle::Drop)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PickleCodec;

fn encode_value(buf: &mut BytesMut, value: &Value) {
    buf.put_u8(value.particle_type().tag());
    match value {
        Value::Nil => {}
        Value::Bool(b) => buf.put_u8(u8::from(*b)),
        Value::Int(i) => buf.put_i64(*i),
        Value::Float(f) => buf.put_f64(*f),
        Value::String(s) => {
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u32(b.len() as u32);
            buf.put_slice(b);
        }
        Value::List(items) => {
            buf.put_u32(items.len() as u32);
            for item in items {
                encode_value(buf, item);
            }
        }
        Value::Map(entries) => {
            buf.put_u32(entries.len() as u32);
            for (k, v) in entries {
                buf.put_u16(k.len() as u16);
                buf.put_slice(k.as_bytes());
                encode_value(buf, v);
            }
        }
    }
}

fn decode_value(buf: &mut Bytes) -> Result<Value, String> {
    if buf.remaining() < 1 {
        return Err("truncated value: missing particle tag".into());
    }
    let tag = buf.get_u8();
    let particle = ParticleType::from_tag(tag).ok_or_else(|| format!("unknown particle tag {tag}"))?;
    Ok(match particle {
        ParticleType::Nil => Value::Nil,
        ParticleType::Bool => {
            require(buf, 1, "bool")?;
            Value::Bool(buf.get_u8() != 0)
        }
        ParticleType::Int => {
            require(buf, 8, "int")?;
            Value::Int(buf.get_i64())
        }
        ParticleType::Float => {
            require(buf, 8, "float")?;
            Value::Float(buf.get_f64())
        }
        ParticleType::String => {
            require(buf, 4, "string length")?;
            let len = buf.get_u32() as usize;
            require(buf, len, "string body")?;
            let bytes = buf.copy_to_bytes(len);
            Value::String(String::from_utf8(bytes.to_vec()).map_err(|e| e.to_string())?)
        }
        ParticleType::Bytes => {
            require(buf, 4, "bytes length")?;
            let len = buf.get_u32() as usize;
            require(buf, len, "bytes body")?;
            Value::Bytes(buf.copy_to_bytes(len).to_vec())
        }
        ParticleType::List => {
            require(buf, 4, "list length")?;
            let count = buf.get_u32();
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(decode_value(buf)?);
            }
            Value::List(items)
        }
        ParticleType::Map => {
            require(buf, 4, "map length")?;
            let count = buf.get_u32();
            let mut map = BTreeMap::new();
            for _ in 0..count {
                require(buf, 2, "map key length")?;
                let klen = buf.get_u16() as usize;
                require(buf, klen, "map key body")?;
                let key = String::from_utf8(buf.copy_to_bytes(klen).to_vec()).map_err(|e| e.to_string())?;
                let value = decode_value(buf)?;
                map.insert(key, value);
            }
            Value::Map(map)
        }
    })
}

fn require(buf: &Bytes, n: usize, what: &str) -> Result<(), String> {
    if buf.remaining() < n {
        Err(format!("truncated pickle: need {n} more bytes for {what}"))
    } else {
        Ok(())
    }
}

impl Encoder<Pickle> for PickleCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Pickle, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Pickle::Drop => {
                dst.put_u8(DROP_BIT);
                dst.put_u16(0);
            }
            Pickle::Bins(bins) => {
                dst.put_u8(0);
                dst.put_u16(bins.len() as u16);
                for (name, value) in &bins {
                    dst.put_u8(name.len() as u8);
                    dst.put_slice(name.as_bytes());
                    dst.put_u8(value.particle_type().tag());
                    dst.put_u8(0); // bin flags, unused for now

                    let mut value_buf = BytesMut::new();
                    // encode_value writes its own tag too; skip the duplicate
                    // by encoding payload-only here via a throwaway buffer.
                    encode_value(&mut value_buf, value);
                    let tag_len = 1;
                    let payload = &value_buf[tag_len..];
                    dst.put_u32(payload.len() as u32);
                    dst.put_slice(payload);
                }
            }
        }
        Ok(())
    }
}

impl Decoder for PickleCodec {
    type Item = Pickle;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 3 {
            return Ok(None);
        }
        let mut peek = src.clone().freeze();
        let info = peek.get_u8();
        let bin_count = peek.get_u16();

        if info & DROP_BIT != 0 {
            if bin_count != 0 {
                return Err(malformed("drop pickle carried a nonzero bin count"));
            }
            src.advance(3);
            return Ok(Some(Pickle::Drop));
        }

        if bin_count == 0 {
            return Err(malformed("bin count is zero without the drop bit set"));
        }

        let mut cursor = peek;
        let mut bins = BTreeMap::new();
        for _ in 0..bin_count {
            if cursor.remaining() < 1 {
                return Ok(None);
            }
            let name_len = cursor.get_u8() as usize;
            if cursor.remaining() < name_len + 1 + 1 + 4 {
                return Ok(None);
            }
            let name = String::from_utf8(cursor.copy_to_bytes(name_len).to_vec())
                .map_err(|e| malformed(&e.to_string()))?;
            let _tag = cursor.get_u8(); // re-derived from the value payload itself
            let _flags = cursor.get_u8();
            let value_len = cursor.get_u32() as usize;
            if cursor.remaining() < value_len {
                return Ok(None);
            }
            let value_bytes = cursor.copy_to_bytes(value_len);
            // Re-prepend the tag byte we consumed above so decode_value sees it.
            let mut rebuilt = BytesMut::with_capacity(value_len + 1);
            rebuilt.put_u8(_tag);
            rebuilt.put(value_bytes);
            let mut rebuilt = rebuilt.freeze();
            let value = decode_value(&mut rebuilt).map_err(|e| malformed(&e))?;
            bins.insert(name, value);
        }

        let consumed = src.len() - cursor.remaining();
        src.advance(consumed);
        Ok(Some(Pickle::Bins(bins)))
    }
}

fn malformed(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

/// Reads a still-framed pickle's bin count without running the decoder.
/// `None` if `buf` doesn't yet hold the 3-byte header.
#[must_use]
pub fn peek_bin_count(buf: &[u8]) -> Option<u16> {
    if buf.len() < 3 {
        return None;
    }
    Some(u16::from_be_bytes([buf[1], buf[2]]))
}

/// Sums a still-framed pickle's on-disk footprint (bin names plus bin
/// values) by walking the raw frame, without decoding any value -- the
/// cheap check a replica runs before paying for a full decode of a write
/// that might exceed its storage budget anyway. A drop pickle has no
/// footprint.
///
/// # Errors
///
/// Returns an error if `buf` is truncated or malformed.
pub fn footprint(buf: &[u8]) -> Result<u64, std::io::Error> {
    if buf.len() < 3 {
        return Err(malformed("truncated pickle: missing header"));
    }
    let info = buf[0];
    let bin_count = u16::from_be_bytes([buf[1], buf[2]]);
    if info & DROP_BIT != 0 {
        return Ok(0);
    }

    let mut cursor = Bytes::copy_from_slice(&buf[3..]);
    let mut total: u64 = 0;
    for _ in 0..bin_count {
        require(&cursor, 1, "bin name length")?;
        let name_len = cursor.get_u8() as usize;
        require(&cursor, name_len, "bin name")?;
        cursor.advance(name_len);
        require(&cursor, 1 + 1 + 4, "bin header")?;
        cursor.advance(2); // tag + flags
        let value_len = cursor.get_u32() as usize;
        require(&cursor, value_len, "bin value")?;
        cursor.advance(value_len);
        total += name_len as u64 + value_len as u64;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(pickle: Pickle) -> Pickle {
        let mut codec = PickleCodec;
        let mut buf = BytesMut::new();
        codec.encode(pickle, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().expect("full frame")
    }

    #[test]
    fn drop_pickle_roundtrips() {
        assert_eq!(roundtrip(Pickle::Drop), Pickle::Drop);
    }

    #[test]
    fn scalar_bins_roundtrip() {
        let mut bins = BTreeMap::new();
        bins.insert("active".to_string(), Value::Bool(true));
        bins.insert("age".to_string(), Value::Int(-7));
        bins.insert("name".to_string(), Value::String("ada".to_string()));
        bins.insert("data".to_string(), Value::Bytes(vec![1, 2, 3]));
        let decoded = roundtrip(Pickle::Bins(bins.clone()));
        assert_eq!(decoded, Pickle::Bins(bins));
    }

    #[test]
    fn nested_list_and_map_roundtrip() {
        let mut inner = BTreeMap::new();
        inner.insert("x".to_string(), Value::Float(1.5));
        let mut bins = BTreeMap::new();
        bins.insert(
            "tags".to_string(),
            Value::List(vec![Value::String("a".into()), Value::Int(3)]),
        );
        bins.insert("point".to_string(), Value::Map(inner));
        let decoded = roundtrip(Pickle::Bins(bins.clone()));
        assert_eq!(decoded, Pickle::Bins(bins));
    }

    #[test]
    fn zero_bins_without_drop_bit_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u8(0);
        buf.put_u16(0);
        let mut codec = PickleCodec;
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn peek_bin_count_matches_the_decoded_count() {
        let mut bins = BTreeMap::new();
        bins.insert("a".to_string(), Value::Int(1));
        bins.insert("b".to_string(), Value::Int(2));
        let mut buf = BytesMut::new();
        PickleCodec.encode(Pickle::Bins(bins), &mut buf).unwrap();
        assert_eq!(peek_bin_count(&buf), Some(2));
    }

    #[test]
    fn peek_bin_count_is_none_on_a_short_buffer() {
        assert_eq!(peek_bin_count(&[0, 1]), None);
    }

    #[test]
    fn footprint_sums_bin_names_and_values_without_decoding() {
        let mut bins = BTreeMap::new();
        bins.insert("name".to_string(), Value::Bytes(vec![0u8; 10]));
        let mut buf = BytesMut::new();
        PickleCodec.encode(Pickle::Bins(bins), &mut buf).unwrap();
        // "name" (4 bytes) + a 10-byte value.
        assert_eq!(footprint(&buf).unwrap(), 14);
    }

    #[test]
    fn footprint_of_a_drop_pickle_is_zero() {
        let mut buf = BytesMut::new();
        PickleCodec.encode(Pickle::Drop, &mut buf).unwrap();
        assert_eq!(footprint(&buf).unwrap(), 0);
    }

    #[test]
    fn footprint_of_a_truncated_frame_errors() {
        let mut bins = BTreeMap::new();
        bins.insert("a".to_string(), Value::Int(1));
        let mut full = BytesMut::new();
        PickleCodec.encode(Pickle::Bins(bins), &mut full).unwrap();
        let partial = &full[..full.len() - 1];
        assert!(footprint(partial).is_err());
    }

    #[test]
    fn truncated_frame_awaits_more_data() {
        let mut bins = BTreeMap::new();
        bins.insert("a".to_string(), Value::Int(1));
        let mut full = BytesMut::new();
        PickleCodec.encode(Pickle::Bins(bins), &mut full).unwrap();
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(PickleCodec.decode(&mut partial).unwrap().is_none());
    }
}

/// Property-based test for the pickle codec's encode/decode round trip
/// (spec.md §8 property 8).
#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    /// Non-recursive value strategy -- a list/map of arbitrary values would
    /// need a recursive combinator, and the wire layout only exercises one
    /// level of nesting differently from a flat bin (the tag byte and
    /// length prefix), so one level of `List`/`Map` is enough to cover it.
    fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Nil),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            (-1e100_f64..1e100_f64).prop_map(Value::Float),
            "[a-zA-Z0-9 ]{0,32}".prop_map(Value::String),
            proptest::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
        ]
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            arb_scalar(),
            proptest::collection::vec(arb_scalar(), 0..4).prop_map(Value::List),
            proptest::collection::btree_map("[a-z]{1,8}", arb_scalar(), 0..4).prop_map(Value::Map),
        ]
    }

    /// Bin names are length-prefixed with a single byte on the wire, so a
    /// name longer than 255 bytes cannot round-trip; keep generated names
    /// well under that.
    fn arb_bins() -> impl Strategy<Value = BTreeMap<String, Value>> {
        proptest::collection::btree_map("[a-z]{1,16}", arb_value(), 0..8).prop_filter(
            "a pickle needs at least one bin or it collapses to the zero-bins-without-drop-bit error",
            |bins| !bins.is_empty(),
        )
    }

    proptest! {
        #[test]
        fn bins_pickle_roundtrips(bins in arb_bins()) {
            let mut codec = PickleCodec;
            let mut buf = BytesMut::new();
            codec.encode(Pickle::Bins(bins.clone()), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().expect("full frame");
            prop_assert_eq!(decoded, Pickle::Bins(bins));
            prop_assert!(buf.is_empty());
        }
    }
}
