//! `multipart/related` body for metadata + media uploads.
//!
//! Deterministic: fixed boundary, fixed part order (JSON metadata, then media).

pub const BOUNDARY: &str = "rrb_upload_boundary_4d2f8a";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartBody {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

pub fn encode_related(
    metadata: &serde_json::Value,
    media_type: &str,
    payload: &[u8],
) -> MultipartBody {
    let meta = metadata.to_string();
    let mut bytes = Vec::with_capacity(payload.len() + meta.len() + 256);

    bytes.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    bytes.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    bytes.extend_from_slice(meta.as_bytes());
    bytes.extend_from_slice(b"\r\n");

    bytes.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    bytes.extend_from_slice(format!("Content-Type: {media_type}\r\n\r\n").as_bytes());
    bytes.extend_from_slice(payload);
    bytes.extend_from_slice(b"\r\n");

    bytes.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    MultipartBody {
        content_type: format!("multipart/related; boundary={BOUNDARY}"),
        bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encodes_metadata_then_media() {
        let body = encode_related(
            &json!({"file": {"displayName": "policy.pdf"}}),
            "application/pdf",
            b"%PDF-1.4",
        );

        assert_eq!(
            body.content_type,
            "multipart/related; boundary=rrb_upload_boundary_4d2f8a"
        );
        let expected = "--rrb_upload_boundary_4d2f8a\r\n\
Content-Type: application/json; charset=UTF-8\r\n\r\n\
{\"file\":{\"displayName\":\"policy.pdf\"}}\r\n\
--rrb_upload_boundary_4d2f8a\r\n\
Content-Type: application/pdf\r\n\r\n\
%PDF-1.4\r\n\
--rrb_upload_boundary_4d2f8a--\r\n";
        assert_eq!(String::from_utf8(body.bytes).unwrap(), expected);
    }

    #[test]
    fn binary_payload_is_copied_verbatim() {
        let payload = [0u8, 159, 146, 150, 13, 10];
        let body = encode_related(&json!({}), "application/octet-stream", &payload);
        assert!(body
            .bytes
            .windows(payload.len())
            .any(|w| w == payload.as_slice()));
    }
}
