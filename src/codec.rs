//! Storage codec: bucket keys, packed fields and scan patterns
//!
//! The wire layout inside the store is fixed by this module:
//!
//! ```text
//! key   = prefix <SEP> resolution-name <SEP> marshalled-time <SEP> event-name
//! field = (len-byte value-bytes)*          one pair per declared label
//! ```
//!
//! `SEP` is the ASCII unit separator `0x1F`. Fields are length-prefixed with
//! one byte per declared label position and carry no terminator; a missing
//! trailing value is encoded as a single zero byte. Scan patterns escape the
//! glob metacharacters `* [ ] ? ^` so literal label values never glob-match.
//!
//! # Example
//!
//! ```rust
//! use meterdb::codec::Codec;
//!
//! let labels = vec!["foo".to_string(), "bar".to_string()];
//! let field = Codec::field(labels.len(), &["baz".into(), "qux".into()]);
//! let parsed = Codec::parse_field(&field, &labels).unwrap();
//! assert_eq!(parsed.get("foo").map(String::as_str), Some("baz"));
//! assert_eq!(parsed.get("bar").map(String::as_str), Some("qux"));
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::types::Resolution;

/// Byte joining the segments of a bucket key (ASCII unit separator)
pub const KEY_SEPARATOR: u8 = 0x1F;

/// Default bucket key prefix
pub const DEFAULT_KEY_PREFIX: &str = "meter";

/// Maximum encodable label value length; longer values are truncated
pub const MAX_VALUE_LEN: usize = 255;

/// Glob metacharacters escaped in scan patterns
const GLOB_META: [u8; 5] = [b'*', b'[', b']', b'?', b'^'];

/// Key and field codec for one store namespace
///
/// Holds the key prefix and separator; the field encoding itself is static
/// (associated functions) because it depends only on the declared labels.
#[derive(Debug, Clone)]
pub struct Codec {
    prefix: String,
    separator: u8,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX, KEY_SEPARATOR)
    }
}

impl Codec {
    /// Create a codec with an explicit prefix and separator byte
    ///
    /// The separator must be an ASCII byte (`< 0x80`) so keys stay valid
    /// UTF-8 strings.
    pub fn new(prefix: impl Into<String>, separator: u8) -> Self {
        debug_assert!(separator < 0x80, "key separator must be ASCII");
        Self {
            prefix: prefix.into(),
            separator,
        }
    }

    /// Key prefix; an empty prefix emits no leading separator
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Bucket key for `(resolution, event, time)`
    pub fn key(&self, res: &Resolution, event: &str, t: DateTime<Utc>) -> String {
        let sep = self.separator as char;
        let time = res.marshal_time(t);
        let mut key = String::with_capacity(
            self.prefix.len() + res.name().len() + time.len() + event.len() + 3,
        );
        if !self.prefix.is_empty() {
            key.push_str(&self.prefix);
            key.push(sep);
        }
        key.push_str(res.name());
        key.push(sep);
        key.push_str(&time);
        key.push(sep);
        key.push_str(event);
        key
    }

    /// Append the packed field for `values` under `label_count` declared labels
    ///
    /// Each position emits one length byte and the raw value bytes; values
    /// beyond `label_count` are ignored and missing positions pad with a
    /// zero byte.
    pub fn append_field(buf: &mut Vec<u8>, label_count: usize, values: &[String]) {
        for i in 0..label_count {
            let value = values.get(i).map(String::as_bytes).unwrap_or(b"");
            let len = value.len().min(MAX_VALUE_LEN);
            buf.push(len as u8);
            buf.extend_from_slice(&value[..len]);
        }
    }

    /// Packed field for `values` under `label_count` declared labels
    pub fn field(label_count: usize, values: &[String]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(label_count + values.iter().map(String::len).sum::<usize>());
        Self::append_field(&mut buf, label_count, values);
        buf
    }

    /// Packed field for a `label → value` map, in declared label order
    pub fn field_from_map(labels: &[String], values: &HashMap<String, String>) -> Vec<u8> {
        let ordered: Vec<String> = labels
            .iter()
            .map(|l| values.get(l).cloned().unwrap_or_default())
            .collect();
        Self::field(labels.len(), &ordered)
    }

    /// Server-side scan pattern for a bucket
    ///
    /// Positions that are grouped or unfiltered match any non-empty length
    /// prefix followed by arbitrary bytes; filtered positions match the
    /// literal length byte and escaped value.
    pub fn match_pattern(
        labels: &[String],
        group: &[String],
        filter: &HashMap<String, String>,
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(labels.len() * 8);
        for label in labels {
            match filter.get(label) {
                Some(value) if !group.contains(label) => {
                    let bytes = value.as_bytes();
                    let len = bytes.len().min(MAX_VALUE_LEN);
                    append_escaped(&mut buf, &[len as u8]);
                    append_escaped(&mut buf, &bytes[..len]);
                }
                _ => {
                    // Non-zero length byte, then anything
                    buf.extend_from_slice(&[b'[', b'^', 0x00, b']', b'*']);
                }
            }
        }
        buf
    }

    /// Parse a packed field into a `label → value` map
    ///
    /// Returns `None` when a length byte overruns the remaining bytes or the
    /// field is not consumed exactly. Zero-length values are unset and do
    /// not appear in the map.
    pub fn parse_field(field: &[u8], labels: &[String]) -> Option<HashMap<String, String>> {
        let mut rest = field;
        let mut out = HashMap::with_capacity(labels.len());
        for label in labels {
            let (&len, tail) = rest.split_first()?;
            let len = len as usize;
            if len > tail.len() {
                return None;
            }
            let (value, tail) = tail.split_at(len);
            if len > 0 {
                out.insert(label.clone(), String::from_utf8_lossy(value).into_owned());
            }
            rest = tail;
        }
        if !rest.is_empty() {
            return None;
        }
        Some(out)
    }

    /// Test a packed field against a value filter without allocating
    ///
    /// True iff every filter entry equals the value parsed at its declared
    /// position and the field is consumed exactly.
    pub fn match_field(field: &[u8], labels: &[String], filter: &HashMap<String, String>) -> bool {
        let mut rest = field;
        let mut matched = 0usize;
        for label in labels {
            let Some((&len, tail)) = rest.split_first() else {
                return false;
            };
            let len = len as usize;
            if len > tail.len() {
                return false;
            }
            let (value, tail) = tail.split_at(len);
            if let Some(want) = filter.get(label) {
                if want.as_bytes() != value {
                    return false;
                }
                matched += 1;
            }
            rest = tail;
        }
        rest.is_empty() && matched == filter.len()
    }
}

/// Append `bytes` with glob metacharacters backslash-escaped
fn append_escaped(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if GLOB_META.contains(&b) {
            buf.push(b'\\');
        }
        buf.push(b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn labels() -> Vec<String> {
        vec!["foo".to_string(), "bar".to_string()]
    }

    fn filter(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_key_layout() {
        let codec = Codec::default();
        let hourly = Resolution::hourly();
        let t = Utc.with_ymd_and_hms(2023, 4, 2, 11, 30, 0).unwrap();
        let key = codec.key(&hourly, "test", t);
        assert_eq!(key, "meter\u{1f}hourly\u{1f}2023-04-02-11\u{1f}test");
    }

    #[test]
    fn test_key_empty_prefix_has_no_leading_separator() {
        let codec = Codec::new("", KEY_SEPARATOR);
        let hourly = Resolution::hourly();
        let t = Utc.with_ymd_and_hms(2023, 4, 2, 11, 0, 0).unwrap();
        let key = codec.key(&hourly, "test", t);
        assert!(key.starts_with("hourly\u{1f}"));
    }

    #[test]
    fn test_field_layout() {
        let field = Codec::field(2, &["baz".into(), "qux".into()]);
        assert_eq!(field, b"\x03baz\x03qux");
    }

    #[test]
    fn test_field_pads_missing_values() {
        let field = Codec::field(2, &["baz".into()]);
        assert_eq!(field, b"\x03baz\x00");
        // Same field as an explicit empty string
        assert_eq!(field, Codec::field(2, &["baz".into(), String::new()]));
    }

    #[test]
    fn test_field_ignores_excess_values() {
        let field = Codec::field(1, &["a".into(), "b".into()]);
        assert_eq!(field, b"\x01a");
    }

    #[test]
    fn test_field_truncates_long_values() {
        let long = "x".repeat(300);
        let field = Codec::field(1, &[long]);
        assert_eq!(field[0], 255);
        assert_eq!(field.len(), 256);
        // Truncation keeps the field parseable
        let parsed = Codec::parse_field(&field, &["foo".to_string()]).unwrap();
        assert_eq!(parsed["foo"].len(), 255);
    }

    #[test]
    fn test_parse_field_round_trip() {
        let parsed = Codec::parse_field(&Codec::field(2, &["baz".into(), "qux".into()]), &labels())
            .unwrap();
        assert_eq!(parsed, filter(&[("foo", "baz"), ("bar", "qux")]));
    }

    #[test]
    fn test_parse_field_skips_unset_values() {
        let parsed = Codec::parse_field(&Codec::field(2, &["baz".into()]), &labels()).unwrap();
        assert_eq!(parsed, filter(&[("foo", "baz")]));
    }

    #[test]
    fn test_parse_field_rejects_overrun_length() {
        assert!(Codec::parse_field(b"\x05ab", &labels()).is_none());
    }

    #[test]
    fn test_parse_field_rejects_trailing_bytes() {
        assert!(Codec::parse_field(b"\x01a\x01b\x01c", &labels()).is_none());
    }

    #[test]
    fn test_match_field() {
        let field = Codec::field(2, &["baz".into(), "qux".into()]);
        assert!(Codec::match_field(&field, &labels(), &filter(&[("foo", "baz")])));
        assert!(Codec::match_field(
            &field,
            &labels(),
            &filter(&[("foo", "baz"), ("bar", "qux")])
        ));
        assert!(!Codec::match_field(&field, &labels(), &filter(&[("foo", "nope")])));
        // Filter key the event does not declare never matches
        assert!(!Codec::match_field(&field, &labels(), &filter(&[("other", "baz")])));
        // Empty filter matches any well-formed field
        assert!(Codec::match_field(&field, &labels(), &HashMap::new()));
        // Malformed field never matches
        assert!(!Codec::match_field(b"\x09x", &labels(), &HashMap::new()));
    }

    #[test]
    fn test_match_pattern_filtered_position_is_literal() {
        let pattern = Codec::match_pattern(&labels(), &[], &filter(&[("foo", "baz")]));
        // \x03baz then the wildcard position for bar
        assert_eq!(&pattern[..4], b"\x03baz");
        assert_eq!(&pattern[4..], &[b'[', b'^', 0x00, b']', b'*']);
    }

    #[test]
    fn test_match_pattern_escapes_glob_metacharacters() {
        let pattern = Codec::match_pattern(&labels(), &[], &filter(&[("foo", "a*b"), ("bar", "[c]")]));
        let mut expected = vec![3u8];
        expected.extend_from_slice(b"a\\*b");
        expected.push(3);
        expected.extend_from_slice(b"\\[c\\]");
        assert_eq!(pattern, expected);
    }

    #[test]
    fn test_match_pattern_group_position_is_wildcard() {
        let group = vec!["foo".to_string()];
        // A filter on a grouped label is still a wildcard position
        let pattern = Codec::match_pattern(&labels(), &group, &filter(&[("foo", "baz")]));
        assert_eq!(&pattern[..5], &[b'[', b'^', 0x00, b']', b'*']);
    }

    #[test]
    fn test_escaped_values_do_not_glob_match() {
        // A literal "a*b" value must not be matched by a field whose value
        // merely glob-matches the unescaped pattern.
        let stored = Codec::field(2, &["a*b".into(), "[c]".into()]);
        let other = Codec::field(2, &["aXb".into(), "c".into()]);
        let f = filter(&[("foo", "a*b"), ("bar", "[c]")]);
        assert!(Codec::match_field(&stored, &labels(), &f));
        assert!(!Codec::match_field(&other, &labels(), &f));
    }
}
