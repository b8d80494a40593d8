use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, Method, Response, header},
};
use bytes::Bytes;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to build upstream client: {0}")]
    Client(String),
    #[error("invalid upstream url '{url}': {message}")]
    Url { url: String, message: String },
    #[error("upstream request failed: {0}")]
    Upstream(String),
}

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    HeaderName::from_static("keep-alive"),
];

/// Strips hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

pub struct UpstreamProxy {
    client: reqwest::Client,
}

impl UpstreamProxy {
    pub fn new(timeout: Duration) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ProxyError::Client(err.to_string()))?;
        Ok(Self { client })
    }

    /// Sends the request to `base + path` with `query` as the raw query
    /// string and relays the upstream response.
    pub async fn forward(
        &self,
        method: Method,
        base: &str,
        path: &str,
        query: Option<&str>,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response<Body>, ProxyError> {
        let mut url = reqwest::Url::parse(base).map_err(|err| ProxyError::Url {
            url: base.to_string(),
            message: err.to_string(),
        })?;
        let joined = format!("{}{path}", url.path().trim_end_matches('/'));
        url.set_path(&joined);
        url.set_query(query.filter(|query| !query.is_empty()));

        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        debug!(method = %method, url = %url, "forwarding upstream");
        let upstream = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| ProxyError::Upstream(err.to_string()))?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        let bytes = upstream
            .bytes()
            .await
            .map_err(|err| ProxyError::Upstream(err.to_string()))?;

        strip_hop_by_hop(&mut response_headers);
        response_headers.remove(header::CONTENT_LENGTH);

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}
