//! Record and Node Hashing
//!
//! Provides the SHA-256 digests used across the engine:
//! - Canonical data-record hashing (leaf level of a batch tree)
//! - Ordered pair hashing for interior tree nodes
//! - Hex encoding helpers for digests on the wire
//!
//! Records serialize exactly as Python's `json.dumps(doc, sort_keys=True)`
//! prints them, and interior nodes hash the concatenated lowercase hex of
//! their children, so roots and proofs match peers hashing that way.

use std::io;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::ser::Formatter;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Hash output type (256 bits / 32 bytes).
pub type NodeHash = [u8; 32];

/// A digest representing one canonicalized data record.
pub type LeafHash = NodeHash;

/// Errors decoding a hex digest.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DigestError {
    /// Input is not valid hex.
    #[error("digest is not valid hex: {0}")]
    InvalidHex(String),
    /// Input decodes to the wrong number of bytes.
    #[error("digest must be 32 bytes, got {0}")]
    WrongLength(usize),
}

/// Compute a plain SHA-256 of arbitrary data.
pub fn hash_bytes(data: &[u8]) -> NodeHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 of a string, hex encoded.
pub fn sha256_hex(data: &str) -> String {
    hex::encode(hash_bytes(data.as_bytes()))
}

/// Hash two child nodes: `SHA-256(hex(left) || hex(right))`.
///
/// Order matters. The lower-index node is always `left`, both when building
/// and when folding an inclusion proof.
pub fn pair_hash(left: &NodeHash, right: &NodeHash) -> NodeHash {
    let mut text = [0u8; 128];
    let (l, r) = text.split_at_mut(64);
    // Both halves are exactly 64 bytes, so encoding cannot fail.
    let _ = hex::encode_to_slice(left, l);
    let _ = hex::encode_to_slice(right, r);
    hash_bytes(&text)
}

/// JSON layout of Python's `json.dumps` defaults: `", "` and `": "`
/// separators, non-ASCII escaped as `\uXXXX`, floats in `repr` form.
struct SortedAsciiFormatter;

impl Formatter for SortedAsciiFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn write_f64<W: ?Sized + io::Write>(&mut self, writer: &mut W, value: f64) -> io::Result<()> {
        writer.write_all(float_repr(value).as_bytes())
    }

    fn write_string_fragment<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        for ch in fragment.chars() {
            if (' '..='~').contains(&ch) {
                let mut buf = [0u8; 1];
                writer.write_all(ch.encode_utf8(&mut buf).as_bytes())?;
            } else {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}

/// Python `repr(float)`: shortest round-trip digits, positional for
/// exponents in `[-4, 16)`, otherwise `d.ddde+XX`.
fn float_repr(value: f64) -> String {
    let sci = format!("{:e}", value);
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();

    if (-4..16).contains(&exponent) {
        let point = exponent + 1;
        let body = if point <= 0 {
            format!("0.{}{}", "0".repeat(point.unsigned_abs() as usize), digits)
        } else if point as usize >= digits.len() {
            format!("{}{}.0", digits, "0".repeat(point as usize - digits.len()))
        } else {
            let (int, frac) = digits.split_at(point as usize);
            format!("{}.{}", int, frac)
        };
        format!("{}{}", sign, body)
    } else {
        let (head, tail) = digits.split_at(1);
        let mantissa = if tail.is_empty() { head.to_string() } else { format!("{}.{}", head, tail) };
        let exp_sign = if exponent < 0 { '-' } else { '+' };
        format!("{}{}e{}{:02}", sign, mantissa, exp_sign, exponent.unsigned_abs())
    }
}

/// Canonical JSON form of a submitted record.
///
/// `serde_json::Map` keeps keys sorted, so nested payload objects are
/// serialized in a stable order regardless of how the device sent them.
pub fn canonical_record(device_id: &str, payload: &Value, timestamp: u64) -> Vec<u8> {
    let doc = json!({
        "data": payload,
        "device_id": device_id,
        "timestamp": timestamp,
    });
    let mut out = Vec::with_capacity(128);
    let mut ser = serde_json::Serializer::with_formatter(&mut out, SortedAsciiFormatter);
    // Writing a `Value` into a `Vec` cannot fail.
    let _ = doc.serialize(&mut ser);
    out
}

/// Compute the leaf hash of a submitted record.
pub fn record_hash(device_id: &str, payload: &Value, timestamp: u64) -> LeafHash {
    hash_bytes(&canonical_record(device_id, payload, timestamp))
}

/// Encode a digest as lowercase hex (no prefix).
pub fn to_hex(hash: &NodeHash) -> String {
    hex::encode(hash)
}

/// Decode a 32-byte digest from hex, accepting an optional `0x` prefix.
pub fn parse_hex(s: &str) -> Result<NodeHash, DigestError> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(trimmed).map_err(|e| DigestError::InvalidHex(e.to_string()))?;
    if bytes.len() != 32 {
        return Err(DigestError::WrongLength(bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Serde adapter for digests encoded as hex strings.
pub mod hex_digest {
    use super::*;

    /// Serialize a digest as hex.
    pub fn serialize<S: Serializer>(hash: &NodeHash, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&to_hex(hash))
    }

    /// Deserialize a digest from hex.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NodeHash, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_hex(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_hash_order_matters() {
        let a = hash_bytes(b"a");
        let b = hash_bytes(b"b");
        assert_ne!(pair_hash(&a, &b), pair_hash(&b, &a));
    }

    #[test]
    fn test_pair_hash_concatenates_hex() {
        let a = hash_bytes(b"a");
        let b = hash_bytes(b"b");
        let joined = format!("{}{}", to_hex(&a), to_hex(&b));
        assert_eq!(pair_hash(&a, &b), hash_bytes(joined.as_bytes()));
    }

    #[test]
    fn test_known_answers_match_python_json() {
        // hash_data({"device_id": "dev-1", "data": {"temp": 21}, "timestamp": 100})
        let leaf = record_hash("dev-1", &json!({"temp": 21}), 100);
        assert_eq!(
            to_hex(&leaf),
            "75e7c574e52b39cc9850a876484145a042ca5cbde0a370a158bf6c842e80337d"
        );

        let x = hash_bytes(b"x");
        assert_eq!(
            to_hex(&pair_hash(&leaf, &x)),
            "3909fdfe0cd66621f2ce9f006ad932cf77eb9e2c17db5d27e8a2cfaffa658dd1"
        );
    }

    #[test]
    fn test_canonical_record_escapes_like_python() {
        let payload = json!({
            "t": 21.5,
            "big": 1e20,
            "small": 1e-5,
            "n": -0.0,
            "h": 100.0,
            "s": "\u{b0}C \u{1f321}",
            "list": [1, 2.0, "a\u{7f}"],
            "nested": {"z": null, "a": true},
        });
        let bytes = canonical_record("d\u{e9}v-2", &payload, 7);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"data": {"big": 1e+20, "h": 100.0, "list": [1, 2.0, "a\u007f"], "n": -0.0, "nested": {"a": true, "z": null}, "s": "\u00b0C \ud83c\udf21", "small": 1e-05, "t": 21.5}, "device_id": "d\u00e9v-2", "timestamp": 7}"#
        );
        assert_eq!(
            to_hex(&record_hash("d\u{e9}v-2", &payload, 7)),
            "c278ff6a188e4735dca7332a758c9cfc9ca48820663f782f313fed7ae692d220"
        );
    }

    #[test]
    fn test_float_repr() {
        assert_eq!(float_repr(0.1), "0.1");
        assert_eq!(float_repr(1e16), "1e+16");
        assert_eq!(float_repr(1234567890123456.0), "1234567890123456.0");
        assert_eq!(float_repr(0.0001), "0.0001");
        assert_eq!(float_repr(-2.5e-7), "-2.5e-07");
        assert_eq!(float_repr(1.5e300), "1.5e+300");
    }

    #[test]
    fn test_record_hash_ignores_key_order() {
        let p1: Value = serde_json::from_str(r#"{"temp": 21.5, "humidity": 40}"#).unwrap();
        let p2: Value = serde_json::from_str(r#"{"humidity": 40, "temp": 21.5}"#).unwrap();
        assert_eq!(record_hash("dev-1", &p1, 100), record_hash("dev-1", &p2, 100));
    }

    #[test]
    fn test_record_hash_binds_every_field() {
        let payload = json!({"temp": 21});
        let base = record_hash("dev-1", &payload, 100);
        assert_ne!(base, record_hash("dev-2", &payload, 100));
        assert_ne!(base, record_hash("dev-1", &payload, 101));
        assert_ne!(base, record_hash("dev-1", &json!({"temp": 22}), 100));
    }

    #[test]
    fn test_canonical_record_layout() {
        let bytes = canonical_record("dev-1", &json!({"b": 1, "a": 2}), 7);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"data": {"a": 2, "b": 1}, "device_id": "dev-1", "timestamp": 7}"#
        );
    }

    #[test]
    fn test_parse_hex() {
        let h = hash_bytes(b"x");
        assert_eq!(parse_hex(&to_hex(&h)).unwrap(), h);
        assert_eq!(parse_hex(&format!("0x{}", to_hex(&h))).unwrap(), h);
        assert_eq!(parse_hex("abcd"), Err(DigestError::WrongLength(2)));
        assert!(matches!(parse_hex("zz"), Err(DigestError::InvalidHex(_))));
    }
}
