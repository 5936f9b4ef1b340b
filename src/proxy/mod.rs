pub mod debug_logger;
pub mod dispatch;
pub mod pool;
pub mod project_resolver;
pub mod request_rewriter;
pub mod response;


use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};

// The fetch-like call surface shared with the host. Bodies are opaque bytes;
// the rewriter parses JSON bodies where the upstream protocol requires it.
#[derive(Debug, Clone)]
pub struct HostRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl HostRequest {
    pub fn post(url: impl Into<String>, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Some(body),
        }
    }
}

pub enum HostBody {
    Full(Bytes),
    Stream(BoxStream<'static, Result<Bytes, reqwest::Error>>),
}

impl std::fmt::Debug for HostBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostBody::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            HostBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub struct HostResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: HostBody,
}

impl HostResponse {
    // Drains the body into one buffer; test and non-streaming convenience.
    pub async fn collect_body(self) -> Result<Bytes, reqwest::Error> {
        match self.body {
            HostBody::Full(bytes) => Ok(bytes),
            HostBody::Stream(mut stream) => {
                let mut out = Vec::new();
                while let Some(chunk) = stream.next().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(out))
            }
        }
    }
}
