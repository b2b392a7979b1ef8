//! Tunnel wire protocol
//!
//! After the handshake (the origin sends its key as the first text frame) the
//! tunnel carries strictly alternating JSON envelopes:
//!
//! ```text
//! broker -> origin   {"id": "...", "method": "GET", "url": "/users?page=2",
//!                     "headers": {"accept": ["application/json"]}, "body": ""}
//! origin -> broker   {"id": "...", "status": 200,
//!                     "headers": {"x-trace": ["1"]}, "body": {"ok": true}}
//! ```
//!
//! Bodies that are not valid UTF-8 travel base64-encoded with
//! `"body_encoding": "base64"`.

use std::collections::BTreeMap;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::Response,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{RelayError, Result};

/// Header name to ordered values
pub type HeaderMultimap = BTreeMap<String, Vec<String>>;

/// Headers that describe a single connection and are never relayed
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether a header must not cross the relay
#[must_use]
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// How a body string is encoded on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    /// Body is the literal text
    #[default]
    Utf8,
    /// Body is base64 of raw bytes
    Base64,
}

impl BodyEncoding {
    #[allow(clippy::trivially_copy_pass_by_ref)]
    fn is_utf8(&self) -> bool {
        *self == Self::Utf8
    }
}

/// Encode raw bytes as a wire body string
#[must_use]
pub fn encode_body(bytes: &[u8]) -> (String, BodyEncoding) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), BodyEncoding::Utf8),
        Err(_) => (STANDARD.encode(bytes), BodyEncoding::Base64),
    }
}

fn decode_body(body: &str, encoding: BodyEncoding) -> Result<Vec<u8>> {
    match encoding {
        BodyEncoding::Utf8 => Ok(body.as_bytes().to_vec()),
        BodyEncoding::Base64 => STANDARD
            .decode(body)
            .map_err(|e| RelayError::protocol(format!("invalid base64 body: {e}"))),
    }
}

/// Convert an HTTP header map into a multimap, dropping hop-by-hop headers,
/// `host` and `content-length`
#[must_use]
pub fn headers_to_multimap(headers: &HeaderMap) -> HeaderMultimap {
    let mut map = HeaderMultimap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if is_hop_by_hop(name) || name == "host" || name == "content-length" {
            continue;
        }
        if let Ok(value) = value.to_str() {
            map.entry(name.to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}

/// Convert a multimap back into an HTTP header map
///
/// Hop-by-hop headers, `content-length` and entries that are not valid HTTP
/// header names or values are skipped.
#[must_use]
pub fn multimap_to_headers(map: &HeaderMultimap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in map {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::debug!(header = %name, "skipping invalid header name");
            continue;
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(name.clone(), value);
                }
                Err(_) => tracing::debug!(header = %name, "skipping invalid header value"),
            }
        }
    }
    headers
}

/// Parse the handshake frame into the announced key
///
/// The key may be sent bare (`abc`) or as a JSON string (`"abc"`).
#[must_use]
pub fn parse_handshake(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with('"') {
        if let Ok(key) = serde_json::from_str::<String>(trimmed) {
            return key;
        }
    }
    trimmed.to_string()
}

// =============================================================================
// Request Envelope
// =============================================================================

/// A public request serialized for the origin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation identifier, echoed by well-behaved origins
    pub id: Uuid,
    /// HTTP method
    pub method: String,
    /// Origin-local path and query (always starts with `/`)
    pub url: String,
    /// Request headers
    #[serde(default)]
    pub headers: HeaderMultimap,
    /// Request body
    #[serde(default)]
    pub body: String,
    /// Encoding of `body`
    #[serde(default, skip_serializing_if = "BodyEncoding::is_utf8")]
    pub body_encoding: BodyEncoding,
}

impl RequestEnvelope {
    /// Build an envelope from the parts of a public request
    #[must_use]
    pub fn new(method: &Method, url: impl Into<String>, headers: &HeaderMap, body: &[u8]) -> Self {
        let (body, body_encoding) = encode_body(body);
        Self {
            id: Uuid::new_v4(),
            method: method.as_str().to_string(),
            url: url.into(),
            headers: headers_to_multimap(headers),
            body,
            body_encoding,
        }
    }

    /// Decoded request body bytes
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a base64 body does not decode.
    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        decode_body(&self.body, self.body_encoding)
    }

    /// Serialize to the JSON text sent over the tunnel
    ///
    /// # Errors
    ///
    /// Returns a protocol error if serialization fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| RelayError::protocol(e.to_string()))
    }

    /// Parse the JSON text received from the tunnel
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the text is not a request envelope.
    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| RelayError::protocol(format!("invalid request envelope: {e}")))
    }
}

// =============================================================================
// Response Envelope
// =============================================================================

/// The origin's answer to a [`RequestEnvelope`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Correlation identifier; must match the request when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    /// HTTP status code
    pub status: u16,
    /// Response headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: HeaderMultimap,
    /// Response body
    ///
    /// `null` is an empty body, a string is raw text (or base64 bytes), any
    /// other value is sent as JSON.
    #[serde(default)]
    pub body: serde_json::Value,
    /// Encoding of a string `body`
    #[serde(default, skip_serializing_if = "BodyEncoding::is_utf8")]
    pub body_encoding: BodyEncoding,
}

impl ResponseEnvelope {
    /// Build an envelope from a local API response
    ///
    /// JSON bodies are embedded as JSON values, other UTF-8 bodies as strings
    /// and anything else base64-encoded.
    #[must_use]
    pub fn from_parts(id: Uuid, status: u16, headers: &HeaderMap, body: &[u8]) -> Self {
        let is_json = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));

        let (body, body_encoding) = if body.is_empty() {
            (serde_json::Value::Null, BodyEncoding::Utf8)
        } else if let Some(value) = is_json
            .then(|| serde_json::from_slice::<serde_json::Value>(body).ok())
            .flatten()
        {
            (value, BodyEncoding::Utf8)
        } else {
            let (text, encoding) = encode_body(body);
            (serde_json::Value::String(text), encoding)
        };

        Self {
            id: Some(id),
            status,
            headers: headers_to_multimap(headers),
            body,
            body_encoding,
        }
    }

    /// An error answer produced by the origin side itself
    #[must_use]
    pub fn error(id: Uuid, status: u16, message: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            status,
            headers: HeaderMultimap::new(),
            body: serde_json::json!({ "error": message.into() }),
            body_encoding: BodyEncoding::Utf8,
        }
    }

    /// Serialize to the JSON text sent over the tunnel
    ///
    /// # Errors
    ///
    /// Returns a protocol error if serialization fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| RelayError::protocol(e.to_string()))
    }

    /// Parse and check a reply to the request with id `request_id`
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the data is not a response envelope, the
    /// status is not a final status in `200..=599`, the echoed id belongs to
    /// another request, or the body does not match its encoding.
    pub fn decode_reply(data: &[u8], request_id: Uuid) -> Result<Self> {
        let envelope: Self = serde_json::from_slice(data)
            .map_err(|e| RelayError::protocol(format!("invalid response envelope: {e}")))?;

        // 1xx cannot be replayed as a final response
        if !(200..=599).contains(&envelope.status) {
            return Err(RelayError::protocol(format!(
                "invalid status code: {}",
                envelope.status
            )));
        }

        if let Some(id) = envelope.id {
            if id != request_id {
                return Err(RelayError::protocol(format!(
                    "response id {id} does not match request {request_id}"
                )));
            }
        }

        envelope.body_parts()?;

        Ok(envelope)
    }

    /// Raw body bytes and the content type implied by the body's JSON shape
    fn body_parts(&self) -> Result<(Vec<u8>, Option<&'static str>)> {
        match (&self.body, self.body_encoding) {
            (serde_json::Value::Null, _) => Ok((Vec::new(), None)),
            (serde_json::Value::String(text), BodyEncoding::Base64) => {
                Ok((decode_body(text, BodyEncoding::Base64)?, None))
            }
            (_, BodyEncoding::Base64) => Err(RelayError::protocol(
                "base64 body must be a JSON string",
            )),
            (serde_json::Value::String(text), BodyEncoding::Utf8) => Ok((
                text.as_bytes().to_vec(),
                Some("text/plain; charset=utf-8"),
            )),
            (value, BodyEncoding::Utf8) => {
                let bytes = serde_json::to_vec(value)
                    .map_err(|e| RelayError::protocol(e.to_string()))?;
                Ok((bytes, Some("application/json")))
            }
        }
    }

    /// Replay this envelope as the public HTTP response
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the status or body cannot be represented.
    pub fn into_response(self) -> Result<Response> {
        let status = StatusCode::from_u16(self.status)
            .map_err(|_| RelayError::protocol(format!("invalid status code: {}", self.status)))?;
        let (body, default_content_type) = self.body_parts()?;
        let mut headers = multimap_to_headers(&self.headers);

        if let Some(content_type) = default_content_type {
            if !headers.contains_key(header::CONTENT_TYPE) {
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
            }
        }

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}
