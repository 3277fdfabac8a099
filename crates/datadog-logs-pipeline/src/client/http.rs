// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::error;

use super::destination::{Transport, TransportError};
use crate::config::Endpoint;
use crate::message::Payload;

/// POSTs encoded records to a logs intake endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    compression_level: Option<i32>,
}

impl HttpTransport {
    #[must_use]
    pub fn new(endpoint: &Endpoint, client: reqwest::Client) -> Self {
        let compression_level = endpoint
            .use_compression
            .then_some(endpoint.compression_level);
        Self {
            client,
            url: endpoint.url(),
            headers: build_headers(endpoint, compression_level.is_some()),
            compression_level,
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    fn body(&self, payload: &Payload) -> Result<Vec<u8>, TransportError> {
        match self.compression_level {
            Some(level) => zstd::encode_all(payload.encoded(), level)
                .map_err(|e| TransportError::Permanent(format!("failed to compress payload: {e}"))),
            None => Ok(payload.encoded().to_vec()),
        }
    }
}

fn build_headers(endpoint: &Endpoint, compressed: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    match HeaderValue::from_str(&endpoint.api_key) {
        Ok(api_key) => {
            headers.insert("DD-API-KEY", api_key);
        }
        Err(_) => error!("LOGS | API key for {} contains invalid header characters", endpoint.host),
    }
    let content_type = if endpoint.use_proto {
        "application/x-protobuf"
    } else {
        "application/json"
    };
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert("DD-PROTOCOL", HeaderValue::from_static("agent-json"));
    if compressed {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
    }
    headers
}

/// 4xx responses are final, except timeouts and rate limiting.
fn classify(status: StatusCode) -> Result<(), TransportError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::FORBIDDEN {
        error!(
            "LOGS | Request was denied by Datadog: Access denied. Please verify that your API key is valid."
        );
    }
    let retryable = !status.is_client_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    if retryable {
        Err(TransportError::Transient(status.to_string()))
    } else {
        Err(TransportError::Permanent(status.to_string()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, payload: &Payload) -> Result<(), TransportError> {
        let body = self.body(payload)?;
        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;
        classify(response.status())
    }
}
