use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, HOST};
use reqwest::Method;
use url::Url;

use crate::error::{AppError, AppResult};

use super::HostRequest;

const GENERATIVE_HOST_SUFFIXES: [&str; 2] = [
    "cloudcode-pa.googleapis.com",
    "generativelanguage.googleapis.com",
];

// URL predicate for the generative-language surface. Everything else is
// passed through to the underlying fetch untouched.
pub fn is_generative_request(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    GENERATIVE_HOST_SUFFIXES
        .iter()
        .any(|suffix| host == *suffix || host.ends_with(&format!(".{}", suffix)))
        || parsed.path().contains("/v1internal")
}

// A fully rewritten outbound request plus the context the classifier and
// transformer need afterwards.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub streaming: bool,
    pub requested_model: Option<String>,
    pub effective_model: Option<String>,
    pub project_id: String,
    pub endpoint: String,
}

// Pure rewrite of one host call for one (endpoint, access token, project)
// triple: swap the base URL, inject the bearer token, and stamp the project
// into the JSON body the way the v1internal protocol expects.
pub fn prepare(
    original: &HostRequest,
    access_token: &str,
    project_id: &str,
    endpoint: &str,
) -> AppResult<Prepared> {
    let source = Url::parse(&original.url)
        .map_err(|e| AppError::Config(format!("unparseable request URL {}: {}", original.url, e)))?;
    let base = Url::parse(endpoint)
        .map_err(|e| AppError::Config(format!("unparseable endpoint {}: {}", endpoint, e)))?;

    let mut target = base;
    target.set_path(source.path());
    target.set_query(source.query());

    let mut headers = original.headers.clone();
    headers.remove(HOST);
    headers.remove(reqwest::header::CONTENT_LENGTH);
    let bearer = HeaderValue::from_str(&format!("Bearer {}", access_token))
        .map_err(|_| AppError::Config("access token is not a valid header value".to_string()))?;
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(
        reqwest::header::USER_AGENT,
        HeaderValue::from_str(crate::constants::USER_AGENT.as_str())
            .unwrap_or_else(|_| HeaderValue::from_static("antigravity-relay")),
    );

    let mut requested_model = None;
    let body = match &original.body {
        Some(raw) => match serde_json::from_slice::<serde_json::Value>(raw) {
            Ok(mut json) => {
                if let Some(obj) = json.as_object_mut() {
                    requested_model = obj
                        .get("model")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    obj.insert(
                        "project".to_string(),
                        serde_json::Value::String(project_id.to_string()),
                    );
                }
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                Some(Bytes::from(serde_json::to_vec(&json).map_err(|e| {
                    AppError::Config(format!("failed to re-serialize request body: {}", e))
                })?))
            }
            // Non-JSON bodies travel untouched.
            Err(_) => Some(raw.clone()),
        },
        None => None,
    };

    let streaming = detect_streaming(&target, &original.headers);

    Ok(Prepared {
        method: original.method.clone(),
        url: target.to_string(),
        headers,
        body,
        streaming,
        effective_model: requested_model.clone(),
        requested_model,
        project_id: project_id.to_string(),
        endpoint: endpoint.to_string(),
    })
}

fn detect_streaming(url: &Url, headers: &HeaderMap) -> bool {
    if url.path().contains(":streamGenerateContent") {
        return true;
    }
    if url
        .query_pairs()
        .any(|(k, v)| k == "alt" && v == "sse")
    {
        return true;
    }
    headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false)
}
