//! Direct-fetch forwarding
//!
//! For keys registered with a reachable origin URL the broker makes the
//! upstream call itself and copies the result back verbatim.

use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, Method},
    response::Response,
};
use bytes::Bytes;

use crate::protocol::is_hop_by_hop;
use crate::{RelayError, Result};

/// Join an origin base URL with the path suffix and query of a public request
///
/// The suffix is appended only when it is more than `/`, so `/api/{key}` hits
/// the registered URL unchanged.
#[must_use]
pub fn target_url(base: &str, suffix: &str, query: Option<&str>) -> String {
    let mut url = base.to_string();

    if !suffix.is_empty() && suffix != "/" {
        if url.ends_with('/') && suffix.starts_with('/') {
            url.push_str(&suffix[1..]);
        } else if !url.ends_with('/') && !suffix.starts_with('/') {
            url.push('/');
            url.push_str(suffix);
        } else {
            url.push_str(suffix);
        }
    }

    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str(query);
    }

    url
}

fn skip_request_header(name: &str) -> bool {
    is_hop_by_hop(name) || name == "host" || name == "content-length"
}

/// Outbound HTTP client for direct-fetch bindings
#[derive(Debug, Clone)]
pub struct DirectForwarder {
    client: reqwest::Client,
}

impl DirectForwarder {
    /// Create a forwarder whose calls are bounded by `timeout`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| RelayError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Forward a request to `url` and return the upstream response as-is
    ///
    /// Non-2xx upstream statuses are returned, not treated as errors.
    ///
    /// # Errors
    ///
    /// - [`RelayError::Timeout`] if the upstream does not answer in time
    /// - [`RelayError::Upstream`] if the call fails
    pub async fn forward(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response> {
        let mut outbound = HeaderMap::new();
        for (name, value) in headers {
            if !skip_request_header(name.as_str()) {
                outbound.append(name.clone(), value.clone());
            }
        }

        tracing::debug!(method = %method, url = %url, "forwarding to origin");

        let upstream = self
            .client
            .request(method, url)
            .headers(outbound)
            .body(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = upstream.status();
        let mut response_headers = HeaderMap::new();
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop(name.as_str()) && name.as_str() != "content-length" {
                response_headers.append(name.clone(), value.clone());
            }
        }

        let body = upstream.bytes().await.map_err(map_reqwest_error)?;

        tracing::debug!(url = %url, status = status.as_u16(), "origin responded");

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> RelayError {
    if err.is_timeout() {
        RelayError::Timeout
    } else {
        RelayError::upstream(err.to_string())
    }
}
