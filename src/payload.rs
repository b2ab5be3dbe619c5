use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;

/// Key-name fragments that mark a field as carrying an inline image.
const IMAGE_KEY_HINTS: [&str; 3] = ["thumb", "thumbnail", "snapshot"];

const DATA_URI_PREFIX: &str = "data:image";

/// Inline strings longer than this are treated as image payloads even when
/// they lack a data-URI prefix. Vendor payloads ship bare base64 this way.
const INLINE_IMAGE_MIN_LEN: usize = 100;

fn is_image_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    IMAGE_KEY_HINTS.iter().any(|hint| key.contains(hint))
}

/// Produce a copy of `value` with every image-bearing leaf replaced by a short
/// placeholder carrying the original length, so payloads can be logged without
/// dumping base64 blobs. The output has the same nested shape as the input.
pub fn sanitize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut cleaned = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                if is_image_key(key) {
                    let placeholder = match val {
                        // Already-redacted values pass through unchanged so
                        // sanitizing twice yields the same tree.
                        Value::String(s) if s.starts_with("<filtered") => s.clone(),
                        Value::String(s) => {
                            format!("<filtered image, len={}: redacted>", s.len())
                        }
                        _ => "<filtered binary>".to_string(),
                    };
                    cleaned.insert(key.clone(), Value::String(placeholder));
                } else {
                    cleaned.insert(key.clone(), sanitize(val));
                }
            }
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        Value::String(s) if s.starts_with(DATA_URI_PREFIX) && s.len() > INLINE_IMAGE_MIN_LEN => {
            Value::String(format!("<filtered data:image, len={}: redacted>", s.len()))
        }
        other => other.clone(),
    }
}

/// Depth-first search for the first embedded image in an arbitrarily nested
/// payload. Mapping entries are checked in received order (key heuristic
/// first, then recursion into the value), then sequence elements in order,
/// which keeps the result deterministic for a given payload shape.
pub fn extract_image(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                if is_image_key(key) {
                    if let Value::String(s) = val {
                        if s.starts_with(DATA_URI_PREFIX) || s.len() > INLINE_IMAGE_MIN_LEN {
                            return Some(s);
                        }
                    }
                }
                if let Some(found) = extract_image(val) {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(extract_image),
        _ => None,
    }
}

/// Strip a `data:image/...;base64,` prefix if present, leaving bare base64.
pub fn strip_data_uri(data: &str) -> &str {
    if data.starts_with(DATA_URI_PREFIX) {
        match data.split_once(',') {
            Some((_, rest)) => rest,
            None => data,
        }
    } else {
        data
    }
}

/// Decode an embedded image (bare base64 or data URI) to raw bytes.
pub fn decode_base64_image(data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(strip_data_uri(data).trim())
        .context("invalid base64 image data")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn big_payload() -> String {
        "A".repeat(200)
    }

    #[test]
    fn sanitize_replaces_thumbnail_fields() {
        let blob = big_payload();
        let input = json!({
            "alarm": { "name": "Motion Front" },
            "thumbnail": blob,
        });
        let cleaned = sanitize(&input);

        assert_eq!(
            cleaned["thumbnail"],
            json!(format!("<filtered image, len={}: redacted>", blob.len()))
        );
        assert_eq!(cleaned["alarm"]["name"], json!("Motion Front"));
    }

    #[test]
    fn sanitize_replaces_non_string_image_fields_with_generic_placeholder() {
        let input = json!({ "snapshot": { "inner": "data" } });
        let cleaned = sanitize(&input);
        assert_eq!(cleaned["snapshot"], json!("<filtered binary>"));
    }

    #[test]
    fn sanitize_catches_data_uris_under_unrelated_keys() {
        let uri = format!("{DATA_URI_PREFIX}/jpeg;base64,{}", big_payload());
        let input = json!({ "picture": uri });
        let cleaned = sanitize(&input);
        let replaced = cleaned["picture"].as_str().unwrap();
        assert!(replaced.starts_with("<filtered data:image"));
        assert!(!replaced.starts_with(DATA_URI_PREFIX));
    }

    #[test]
    fn sanitize_keeps_short_strings_and_scalars() {
        let input = json!({
            "note": "data:image-ish but short",
            "count": 3,
            "flag": true,
            "nothing": null,
        });
        assert_eq!(sanitize(&input), input);
    }

    #[test]
    fn sanitize_is_idempotent() {
        let input = json!({
            "thumbnail": big_payload(),
            "nested": { "camera_snapshot": big_payload() },
            "items": [ { "thumb": big_payload() }, "plain" ],
            "inline": format!("data:image/png;base64,{}", big_payload()),
        });
        let once = sanitize(&input);
        let twice = sanitize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn sanitize_never_leaks_the_original_blob() {
        let blob = big_payload();
        let input = json!({
            "deep": { "list": [ { "thumbnail": blob } ] },
        });
        let rendered = serde_json::to_string(&sanitize(&input)).unwrap();
        assert!(!rendered.contains(&blob));
    }

    #[test]
    fn extract_finds_nested_thumbnail() {
        let blob = big_payload();
        let input = json!({
            "alarm": {
                "triggers": [ { "device": "CAM1", "thumbnail": blob } ],
            },
        });
        assert_eq!(extract_image(&input), Some(blob.as_str()));
    }

    #[test]
    fn extract_is_deterministic_across_sibling_order() {
        let blob = big_payload();
        let a = json!({ "zzz": "noise", "snapshot": blob, "aaa": 1 });
        let b = json!({ "aaa": 1, "snapshot": blob, "zzz": "noise" });
        assert_eq!(extract_image(&a), Some(blob.as_str()));
        assert_eq!(extract_image(&b), Some(blob.as_str()));
    }

    #[test]
    fn extract_accepts_short_data_uris_and_long_bare_strings() {
        let uri = json!({ "thumb": "data:image/jpeg;base64,abc" });
        assert!(extract_image(&uri).is_some());

        let bare = json!({ "thumb": big_payload() });
        assert!(extract_image(&bare).is_some());

        // A short bare string under an image key does not qualify.
        let short = json!({ "thumb": "tiny" });
        assert_eq!(extract_image(&short), None);
    }

    #[test]
    fn extract_ignores_long_strings_under_unrelated_keys() {
        let input = json!({ "description": big_payload() });
        assert_eq!(extract_image(&input), None);
    }

    #[test]
    fn strip_data_uri_handles_both_forms() {
        assert_eq!(strip_data_uri("data:image/jpeg;base64,Zm9v"), "Zm9v");
        assert_eq!(strip_data_uri("Zm9v"), "Zm9v");
    }

    #[test]
    fn decode_roundtrips_raw_bytes() {
        let encoded = BASE64.encode(b"jpeg bytes");
        let decoded = decode_base64_image(&format!("data:image/jpeg;base64,{encoded}")).unwrap();
        assert_eq!(decoded, b"jpeg bytes");

        assert!(decode_base64_image("not base64!!!").is_err());
    }
}
