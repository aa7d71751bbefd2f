use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha512};

use crate::types::ContentValue;

/// Stable content hash of a configuration object.
///
/// Entries are serialized as `key=value` with binary values base64-encoded,
/// the entry list is sorted bytewise, joined with `;` and hashed with
/// SHA-512 truncated to 256 bits. Metadata never contributes, so label or
/// annotation churn cannot change the fingerprint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(content: &BTreeMap<String, ContentValue>) -> Fingerprint {
        let mut entries: Vec<String> = content
            .iter()
            .map(|(k, v)| match v {
                ContentValue::Text(s) => format!("{k}={s}"),
                ContentValue::Binary(b) => format!("{k}={}", BASE64.encode(b)),
            })
            .collect();
        entries.sort();
        Fingerprint(hash(entries.join(";").as_bytes()))
    }

    /// Fingerprint standing in for a deleted object: the hash of empty
    /// content.
    pub fn of_deleted() -> Fingerprint {
        Fingerprint::of(&BTreeMap::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn hash(input: &[u8]) -> String {
    let digest = Sha512::digest(input);
    hex::encode(&digest[..32])
}

/// Short stable digest for embedding a long name into a bounded identifier.
pub fn name_digest(name: &str) -> String {
    let digest = Sha512::digest(name.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> ContentValue {
        ContentValue::Text(s.to_string())
    }

    #[test]
    fn equal_content_equal_fingerprint() {
        let a = BTreeMap::from([
            ("url".to_string(), text("https://example.com")),
            ("user".to_string(), text("admin")),
        ]);
        // Same entries inserted in the opposite order.
        let mut b = BTreeMap::new();
        b.insert("user".to_string(), text("admin"));
        b.insert("url".to_string(), text("https://example.com"));
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn single_byte_difference_changes_fingerprint() {
        let a = BTreeMap::from([("url".to_string(), text("old"))]);
        let b = BTreeMap::from([("url".to_string(), text("olD"))]);
        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn binary_and_text_values_are_distinct() {
        let a = BTreeMap::from([("k".to_string(), text("AQID"))]);
        let b = BTreeMap::from([("k".to_string(), ContentValue::Binary(vec![1, 2, 3]))]);
        // base64([1,2,3]) == "AQID", so the serialized entry is identical.
        // Round-trip equality is all that matters here.
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn empty_content_is_stable_and_non_empty() {
        let empty = Fingerprint::of(&BTreeMap::new());
        assert_eq!(empty.as_str().len(), 64);
        assert_eq!(empty, Fingerprint::of_deleted());
    }

    #[test]
    fn keys_with_separators_are_tolerated() {
        let a = BTreeMap::from([("a=b".to_string(), text("c;d"))]);
        let b = BTreeMap::from([("a=b".to_string(), text("c;d"))]);
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
        let c = BTreeMap::from([("a".to_string(), text("b=c;d"))]);
        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&c));
    }

    #[test]
    fn entry_sort_is_bytewise_over_serialized_entries() {
        // "a1=y" sorts before "a=x" ('1' < '='), unlike plain key order.
        let m = BTreeMap::from([
            ("a".to_string(), text("x")),
            ("a1".to_string(), text("y")),
        ]);
        let expected = {
            let joined = "a1=y;a=x";
            let digest = sha2::Sha512::digest(joined.as_bytes());
            hex::encode(&digest[..32])
        };
        assert_eq!(Fingerprint::of(&m).as_str(), expected);
    }
}
