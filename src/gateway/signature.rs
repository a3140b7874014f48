//! Signature primitives shared by the gateway adapters.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use rsa::{pkcs8::DecodePublicKey, Pkcs1v15Sign, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 of `payload` keyed with `secret`.
pub fn hmac_sha256(secret: &[u8], payload: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time comparison. Different lengths compare unequal.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    !expected.is_empty() && expected.ct_eq(provided).unwrap_u8() == 1
}

/// Verify an RSA PKCS#1 v1.5 signature over the SHA-1 digest of `message`.
pub fn verify_rsa_sha1(public_key_pem: &str, message: &[u8], signature: &[u8]) -> bool {
    let key = match RsaPublicKey::from_public_key_pem(public_key_pem.trim()) {
        Ok(key) => key,
        Err(e) => {
            tracing::error!(
                target: "tollway::security",
                error = %e,
                "Configured webhook public key is not a valid PEM"
            );
            return false;
        }
    };
    let digest = Sha1::digest(message);
    key.verify(Pkcs1v15Sign::new::<Sha1>(), &digest, signature).is_ok()
}

/// PHP `serialize()` of a string-to-string array, keys in sorted order.
///
/// Lengths are byte lengths, as PHP computes them.
pub fn php_serialize(fields: &BTreeMap<String, String>) -> String {
    let mut out = format!("a:{}:{{", fields.len());
    for (key, value) in fields {
        out.push_str(&format!("s:{}:\"{}\";", key.len(), key));
        out.push_str(&format!("s:{}:\"{}\";", value.len(), value));
    }
    out.push('}');
    out
}

/// JSON encoding with object keys sorted at every level and no whitespace.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_known_vector() {
        // RFC 4231 test case 2
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"", b""));
    }

    #[test]
    fn test_php_serialize_sorted_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("b".to_string(), "two".to_string());
        fields.insert("a".to_string(), "1".to_string());
        assert_eq!(
            php_serialize(&fields),
            "a:2:{s:1:\"a\";s:1:\"1\";s:1:\"b\";s:3:\"two\";}"
        );
    }

    #[test]
    fn test_php_serialize_uses_byte_length() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), "Zoë".to_string());
        assert_eq!(php_serialize(&fields), "a:1:{s:4:\"name\";s:4:\"Zoë\";}");
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = serde_json::json!({"b": 1, "a": {"z": true, "y": [3, {"d": null, "c": "x"}]}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"y":[3,{"c":"x","d":null}],"z":true},"b":1}"#
        );
    }
}
