use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;

use crate::constants::DEFAULT_RETRY_AFTER_MS;

use super::request_rewriter::Prepared;
use super::{HostBody, HostResponse};

// What the dispatch engine should do with an upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    // Hand the (transformed) response to the host.
    Return,
    // Try the next endpoint with the same account.
    FallbackEndpoint,
    // Cool this account down and rotate to the next one.
    CooldownAccount { retry_after_ms: i64 },
}

// 429 rotates accounts while the pool can absorb it; endpoint problems
// (403/404/5xx) fall back within the same account first. A fallback is only
// taken while another endpoint remains.
pub fn classify(
    status: StatusCode,
    headers: &HeaderMap,
    pool_len: usize,
    has_next_endpoint: bool,
) -> Disposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        if pool_len >= 2 {
            return Disposition::CooldownAccount {
                retry_after_ms: retry_after_ms(headers),
            };
        }
        return if has_next_endpoint {
            Disposition::FallbackEndpoint
        } else {
            Disposition::Return
        };
    }
    if status == StatusCode::FORBIDDEN || status == StatusCode::NOT_FOUND || status.is_server_error()
    {
        return if has_next_endpoint {
            Disposition::FallbackEndpoint
        } else {
            Disposition::Return
        };
    }
    Disposition::Return
}

// `retry-after-ms` (integer milliseconds, >0) wins, then `retry-after`
// (integer seconds), then a 60s default. Malformed values fall through.
pub fn retry_after_ms(headers: &HeaderMap) -> i64 {
    if let Some(ms) = headers
        .get("retry-after-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
    {
        if ms > 0 {
            return ms;
        }
    }
    if let Some(secs) = headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
    {
        if secs >= 0 {
            return secs * 1000;
        }
    }
    DEFAULT_RETRY_AFTER_MS
}

// Converts a successful upstream body back to the shape the host expects:
// the v1internal `{"response": ...}` envelope is unwrapped, per SSE data
// line for streams and whole-body for plain JSON. Anything else passes
// through unchanged.
pub async fn transform(response: reqwest::Response, prepared: &Prepared) -> HostResponse {
    let status = response.status();
    let mut headers = response.headers().clone();
    // The body may change size below.
    headers.remove(reqwest::header::CONTENT_LENGTH);
    headers.remove(reqwest::header::TRANSFER_ENCODING);

    if !status.is_success() {
        let body = response.bytes().await.unwrap_or_default();
        return HostResponse {
            status,
            headers,
            body: HostBody::Full(body),
        };
    }

    if prepared.streaming {
        let upstream = response.bytes_stream().boxed();
        // Lines are rewritten as they complete; whatever is still buffered
        // when the upstream closes is flushed as a final item so a missing
        // trailing newline cannot swallow data.
        let stream = futures::stream::unfold(
            (upstream, Vec::<u8>::new(), false),
            |(mut upstream, mut carry, done)| async move {
                if done {
                    return None;
                }
                match upstream.next().await {
                    Some(Ok(bytes)) => {
                        carry.extend_from_slice(&bytes);
                        let mut out: Vec<u8> = Vec::with_capacity(carry.len());
                        while let Some(pos) = carry.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = carry.drain(..=pos).collect();
                            out.extend_from_slice(&unwrap_sse_line(&line));
                        }
                        Some((Ok(Bytes::from(out)), (upstream, carry, false)))
                    }
                    Some(Err(e)) => Some((Err(e), (upstream, carry, false))),
                    None if carry.is_empty() => None,
                    None => {
                        let rest = std::mem::take(&mut carry);
                        Some((Ok(Bytes::from(unwrap_sse_line(&rest))), (upstream, carry, true)))
                    }
                }
            },
        )
        .boxed();
        return HostResponse {
            status,
            headers,
            body: HostBody::Stream(stream),
        };
    }

    let body = response.bytes().await.unwrap_or_default();
    HostResponse {
        status,
        headers,
        body: HostBody::Full(unwrap_json_body(&body)),
    }
}

fn unwrap_json_body(body: &[u8]) -> Bytes {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(inner) = json.get("response") {
            if let Ok(bytes) = serde_json::to_vec(inner) {
                return Bytes::from(bytes);
            }
        }
    }
    Bytes::copy_from_slice(body)
}

// One newline-terminated SSE line. Only `data:` payloads carrying the
// envelope are rewritten; everything else is forwarded byte-for-byte.
fn unwrap_sse_line(line: &[u8]) -> Vec<u8> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(_) => return line.to_vec(),
    };
    let stripped = text.trim_end_matches(['\r', '\n']);
    let payload = match stripped.strip_prefix("data:") {
        Some(payload) => payload.trim_start(),
        None => return line.to_vec(),
    };
    if payload.is_empty() || payload == "[DONE]" {
        return line.to_vec();
    }
    let Ok(json) = serde_json::from_str::<serde_json::Value>(payload) else {
        return line.to_vec();
    };
    let Some(inner) = json.get("response") else {
        return line.to_vec();
    };
    match serde_json::to_string(inner) {
        Ok(inner_text) => format!("data: {}\n", inner_text).into_bytes(),
        Err(_) => line.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                reqwest::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn retry_after_ms_header_wins() {
        assert_eq!(retry_after_ms(&headers(&[("retry-after-ms", "1500")])), 1500);
        assert_eq!(
            retry_after_ms(&headers(&[("retry-after-ms", "1500"), ("retry-after", "9")])),
            1500
        );
    }

    #[test]
    fn retry_after_seconds_are_scaled() {
        assert_eq!(retry_after_ms(&headers(&[("retry-after", "3")])), 3000);
    }

    #[test]
    fn absent_or_malformed_retry_headers_use_default() {
        assert_eq!(retry_after_ms(&headers(&[])), DEFAULT_RETRY_AFTER_MS);
        assert_eq!(
            retry_after_ms(&headers(&[("retry-after", "soon")])),
            DEFAULT_RETRY_AFTER_MS
        );
        assert_eq!(
            retry_after_ms(&headers(&[("retry-after-ms", "0")])),
            DEFAULT_RETRY_AFTER_MS
        );
        assert_eq!(
            retry_after_ms(&headers(&[("retry-after-ms", "-5")])),
            DEFAULT_RETRY_AFTER_MS
        );
    }

    #[test]
    fn malformed_ms_falls_through_to_seconds() {
        assert_eq!(
            retry_after_ms(&headers(&[("retry-after-ms", "bogus"), ("retry-after", "2")])),
            2000
        );
    }

    #[test]
    fn rate_limit_cools_account_when_pool_can_rotate() {
        let disposition = classify(
            StatusCode::TOO_MANY_REQUESTS,
            &headers(&[("retry-after-ms", "5000")]),
            2,
            true,
        );
        assert_eq!(
            disposition,
            Disposition::CooldownAccount {
                retry_after_ms: 5000
            }
        );
    }

    #[test]
    fn single_account_rate_limit_falls_back_then_returns() {
        let h = headers(&[]);
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, &h, 1, true),
            Disposition::FallbackEndpoint
        );
        // Last endpoint: the 429 is returned as-is, the account is not cooled.
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, &h, 1, false),
            Disposition::Return
        );
    }

    #[test]
    fn endpoint_errors_fall_back_only_while_endpoints_remain() {
        let h = headers(&[]);
        for status in [
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert_eq!(classify(status, &h, 3, true), Disposition::FallbackEndpoint);
            assert_eq!(classify(status, &h, 3, false), Disposition::Return);
        }
    }

    #[test]
    fn ordinary_statuses_return_immediately() {
        let h = headers(&[]);
        for status in [
            StatusCode::OK,
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
        ] {
            assert_eq!(classify(status, &h, 3, true), Disposition::Return);
        }
    }

    #[test]
    fn sse_data_lines_are_unwrapped() {
        let line = b"data: {\"response\":{\"candidates\":[]}}\n";
        let out = unwrap_sse_line(line);
        assert_eq!(out, b"data: {\"candidates\":[]}\n");
    }

    #[test]
    fn sse_control_lines_pass_through() {
        for line in [&b"event: ping\n"[..], b"data: [DONE]\n", b"\n", b": comment\n"] {
            assert_eq!(unwrap_sse_line(line), line.to_vec());
        }
    }

    #[test]
    fn json_body_envelope_is_unwrapped() {
        let body = br#"{"response":{"candidates":[{"content":{}}]}}"#;
        let out = unwrap_json_body(body);
        let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert!(json.get("candidates").is_some());
        assert!(json.get("response").is_none());
    }

    #[test]
    fn json_body_without_envelope_passes_through() {
        let body = br#"{"candidates":[]}"#;
        assert_eq!(unwrap_json_body(body), Bytes::copy_from_slice(body));
    }
}
