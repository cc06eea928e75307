//! Legacy web-safe entity key strings.
//!
//! Datastore Admin names backup files after the key of the backup record in
//! its legacy string form: the onestore `Reference` protobuf, base64 encoded
//! with the URL-safe alphabet and no padding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

const APP_TAG: u64 = 106; // field 13, length-delimited
const PATH_TAG: u64 = 114; // field 14, length-delimited
const NAMESPACE_TAG: u64 = 162; // field 20, length-delimited
const ELEMENT_START: u64 = 11; // group 1 start
const ELEMENT_END: u64 = 12; // group 1 end
const KIND_TAG: u64 = 18; // field 2, length-delimited
const ID_TAG: u64 = 24; // field 3, varint
const NAME_TAG: u64 = 34; // field 4, length-delimited

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyId {
    Id(i64),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathElement {
    pub kind: String,
    pub id: Option<KeyId>,
}

impl PathElement {
    pub fn with_id(kind: impl Into<String>, id: i64) -> Self {
        Self {
            kind: kind.into(),
            id: Some(KeyId::Id(id)),
        }
    }

    pub fn with_name(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: Some(KeyId::Name(name.into())),
        }
    }
}

pub fn encode_legacy_key(app_id: &str, namespace: Option<&str>, path: &[PathElement]) -> String {
    let mut path_bytes = Vec::new();
    for element in path {
        put_varint(&mut path_bytes, ELEMENT_START);
        put_bytes(&mut path_bytes, KIND_TAG, element.kind.as_bytes());
        match &element.id {
            Some(KeyId::Id(id)) => {
                put_varint(&mut path_bytes, ID_TAG);
                put_varint(&mut path_bytes, *id as u64);
            }
            Some(KeyId::Name(name)) => put_bytes(&mut path_bytes, NAME_TAG, name.as_bytes()),
            None => {}
        }
        put_varint(&mut path_bytes, ELEMENT_END);
    }

    let mut reference = Vec::new();
    put_bytes(&mut reference, APP_TAG, app_id.as_bytes());
    put_bytes(&mut reference, PATH_TAG, &path_bytes);
    if let Some(namespace) = namespace.filter(|ns| !ns.is_empty()) {
        put_bytes(&mut reference, NAMESPACE_TAG, namespace.as_bytes());
    }

    URL_SAFE_NO_PAD.encode(reference)
}

fn put_bytes(buf: &mut Vec<u8>, tag: u64, bytes: &[u8]) {
    put_varint(buf, tag);
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_encoding() {
        let mut buf = Vec::new();
        put_varint(&mut buf, 1);
        put_varint(&mut buf, 162);
        put_varint(&mut buf, 300);
        assert_eq!(buf, vec![0x01, 0xa2, 0x01, 0xac, 0x02]);
    }

    #[test]
    fn test_numeric_id_key() {
        let key = encode_legacy_key("a", None, &[PathElement::with_id("K", 1)]);
        assert_eq!(key, "agFhcgcLEgFLGAEM");
    }

    #[test]
    fn test_named_key_with_namespace() {
        let key = encode_legacy_key("a", Some("ns"), &[PathElement::with_name("K", "n")]);
        assert_eq!(key, "agFhcggLEgFLIgFuDKIBAm5z");
    }

    #[test]
    fn test_empty_namespace_is_omitted() {
        let path = [PathElement::with_id("K", 1)];
        assert_eq!(
            encode_legacy_key("a", Some(""), &path),
            encode_legacy_key("a", None, &path)
        );
    }

    #[test]
    fn test_backup_information_key() {
        let key = encode_legacy_key(
            "s~my-project",
            None,
            &[PathElement::with_id("_AE_Backup_Information", 5629499534213120)],
        );
        assert_eq!(
            key,
            "agxzfm15LXByb2plY3RyIwsSFl9BRV9CYWNrdXBfSW5mb3JtYXRpb24YgICAgICAgAoM"
        );
        assert!(!key.contains('='));
        assert!(!key.contains('+'));
        assert!(!key.contains('/'));
    }
}
