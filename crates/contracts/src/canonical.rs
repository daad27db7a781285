use hex::ToHex;
use sha2::Digest;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

pub fn is_sha256_hex(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 64 {
        return false;
    }
    bytes.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Deterministic JSON encoding: object keys sorted lexicographically at every
/// depth, array order preserved, no insignificant whitespace.
pub fn canonical_json_bytes(value: &serde_json::Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

pub fn canonical_json_string(value: &serde_json::Value) -> String {
    String::from_utf8(canonical_json_bytes(value)).unwrap_or_else(|_| "null".to_string())
}

pub fn hash_canonical_json(value: &serde_json::Value) -> String {
    sha256_hex(&canonical_json_bytes(value))
}

fn write_canonical(value: &serde_json::Value, out: &mut Vec<u8>) {
    match value {
        serde_json::Value::Null
        | serde_json::Value::Bool(_)
        | serde_json::Value::Number(_)
        | serde_json::Value::String(_) => {
            let encoded = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
            out.extend_from_slice(&encoded);
        }
        serde_json::Value::Array(items) => {
            out.push(b'[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        serde_json::Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();

            out.push(b'{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(b',');
                }
                let encoded_key = serde_json::to_vec(key).unwrap_or_else(|_| b"\"\"".to_vec());
                out.extend_from_slice(&encoded_key);
                out.push(b':');
                if let Some(child) = map.get(key) {
                    write_canonical(child, out);
                }
            }
            out.push(b'}');
        }
    }
}
