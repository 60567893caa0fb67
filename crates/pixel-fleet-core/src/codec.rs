//! Gzip + base64 wrapping for oversized frames.
//!
//! Frames whose compact JSON encoding reaches the threshold are replaced by a
//! wrapper object:
//!
//! ```json
//! {"type":"__compressed__","encoding":"gzip+base64","originalType":"preview_data",
//!  "originalLength":123456,"compressedLength":2048,"payload":"H4sI..."}
//! ```
//!
//! Decoding never fails: anything that is not a well-formed wrapper comes back
//! unchanged so callers can keep going with the raw value.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::{Value, json};
use tracing::error;

/// Wrapper `type` marker.
pub const COMPRESSED_TYPE: &str = "__compressed__";

/// The only encoding understood on the wire.
pub const ENCODING: &str = "gzip+base64";

/// Latency-critical kinds that are always sent uncompressed.
pub const NO_COMPRESS_TYPES: &[&str] = &["paintBatch", "repairOrder"];

/// Default threshold: 20 MiB of serialized text.
pub const DEFAULT_THRESHOLD: usize = 20 * 1024 * 1024;

/// Serialize `message` for sending, wrapping it if it is large enough.
pub fn compress_if_needed(message: &Value, threshold: usize) -> String {
    let kind = message.get("type").and_then(Value::as_str);
    if !message.is_object() || kind == Some(COMPRESSED_TYPE) {
        return message.to_string();
    }

    // serde_json's Display is already compact.
    let raw = message.to_string();
    if kind.is_some_and(|k| NO_COMPRESS_TYPES.contains(&k)) || raw.len() < threshold {
        return raw;
    }

    match gzip(raw.as_bytes()) {
        Ok(compressed) => {
            let payload = STANDARD.encode(compressed);
            json!({
                "type": COMPRESSED_TYPE,
                "encoding": ENCODING,
                "originalType": kind,
                "originalLength": raw.len(),
                "compressedLength": payload.len(),
                "payload": payload,
            })
            .to_string()
        }
        Err(e) => {
            error!(%e, "Compression failed, sending uncompressed");
            raw
        }
    }
}

/// Unwrap a compressed frame, or return `message` untouched.
///
/// Unsupported encodings, non-string payloads, bad base64, corrupt gzip and
/// non-JSON contents all fall back to the original wrapper.
pub fn try_decompress(message: Value) -> Value {
    if !is_wrapper(&message) {
        return message;
    }
    if message.get("encoding").and_then(Value::as_str) != Some(ENCODING) {
        return message;
    }
    let Some(b64) = message.get("payload").and_then(Value::as_str) else {
        return message;
    };

    match unwrap_payload(b64) {
        Ok(inner) => inner,
        Err(e) => {
            error!(%e, "Decompression failed");
            message
        }
    }
}

/// Whether `message` carries the compressed wrapper marker.
pub fn is_wrapper(message: &Value) -> bool {
    message.get("type").and_then(Value::as_str) == Some(COMPRESSED_TYPE)
}

fn unwrap_payload(b64: &str) -> anyhow::Result<Value> {
    let compressed = STANDARD.decode(b64)?;
    let mut text = String::new();
    GzDecoder::new(compressed.as_slice()).read_to_string(&mut text)?;
    Ok(serde_json::from_str(&text)?)
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big_preview(n: usize) -> Value {
        let pixels: Vec<Value> = (0..n).map(|i| json!({"x": i, "y": i, "color": 5})).collect();
        json!({"type": "preview_data", "slave_id": "a1", "data": {"pixels": pixels}})
    }

    #[test]
    fn test_small_message_passes_through() {
        let msg = json!({"type": "status_update", "slave_id": "a", "status": "idle"});
        let out = compress_if_needed(&msg, DEFAULT_THRESHOLD);
        assert_eq!(serde_json::from_str::<Value>(&out).unwrap(), msg);
    }

    #[test]
    fn test_large_message_is_wrapped_and_restored() {
        let msg = big_preview(500);
        let out = compress_if_needed(&msg, 1024);
        let wrapper: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(wrapper["type"], COMPRESSED_TYPE);
        assert_eq!(wrapper["encoding"], ENCODING);
        assert_eq!(wrapper["originalType"], "preview_data");
        assert_eq!(wrapper["originalLength"], msg.to_string().len());
        assert_eq!(
            wrapper["compressedLength"].as_u64().unwrap() as usize,
            wrapper["payload"].as_str().unwrap().len()
        );
        assert_eq!(try_decompress(wrapper), msg);
    }

    #[test]
    fn test_latency_critical_kinds_never_wrapped() {
        let msg = json!({"type": "paintBatch", "coords": vec![1; 4096]});
        let out = compress_if_needed(&msg, 16);
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["type"], "paintBatch");
    }

    #[test]
    fn test_unsupported_encoding_returns_original() {
        let wrapper = json!({
            "type": COMPRESSED_TYPE,
            "encoding": "brotli",
            "payload": "abcd"
        });
        assert_eq!(try_decompress(wrapper.clone()), wrapper);
    }

    #[test]
    fn test_non_string_payload_returns_original() {
        let wrapper = json!({
            "type": COMPRESSED_TYPE,
            "encoding": ENCODING,
            "payload": [1, 2, 3]
        });
        assert_eq!(try_decompress(wrapper.clone()), wrapper);
    }

    #[test]
    fn test_corrupt_payload_returns_original() {
        let bad_b64 = json!({"type": COMPRESSED_TYPE, "encoding": ENCODING, "payload": "%%%"});
        assert_eq!(try_decompress(bad_b64.clone()), bad_b64);

        let not_gzip = json!({
            "type": COMPRESSED_TYPE,
            "encoding": ENCODING,
            "payload": STANDARD.encode(b"plain text")
        });
        assert_eq!(try_decompress(not_gzip.clone()), not_gzip);
    }

    #[test]
    fn test_non_wrapper_untouched() {
        let msg = json!({"type": "log", "message": "hi"});
        assert_eq!(try_decompress(msg.clone()), msg);
        assert_eq!(try_decompress(json!("text")), json!("text"));
    }
}
