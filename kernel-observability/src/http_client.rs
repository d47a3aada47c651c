use crate::request_logger::{current_operation_id, RequestLogger};
use reqwest::header::HeaderMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

const MAX_LOGGED_BODY_BYTES: usize = 2000;
const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie", "x-api-key"];

/// Wraps `reqwest::Client` so every outbound call attaches the current
/// operation id and records a log line on start, end, and error. Used by
/// plugins that need to call out to third-party services (device cloud
/// APIs, webhook targets) while staying inside the same trace as the
/// request that triggered the call.
pub struct LoggedHttpClient {
    inner: reqwest::Client,
    logger: Arc<RequestLogger>,
}

fn sanitize_headers(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers.iter() {
        let name = name.as_str();
        let shown = if SENSITIVE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            "***".to_string()
        } else {
            value.to_str().unwrap_or("<binary>").to_string()
        };
        map.insert(name.to_string(), json!(shown));
    }
    Value::Object(map)
}

fn truncated_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    let truncated = bytes.len() > MAX_LOGGED_BODY_BYTES;
    let slice = &bytes[..bytes.len().min(MAX_LOGGED_BODY_BYTES)];
    if !truncated {
        if let Ok(parsed) = serde_json::from_slice::<Value>(bytes) {
            return parsed;
        }
    }
    let text = String::from_utf8_lossy(slice).into_owned();
    json!(if truncated { format!("{text}... (truncated)") } else { text })
}

impl LoggedHttpClient {
    pub fn new(logger: Arc<RequestLogger>) -> Self {
        Self { inner: reqwest::Client::new(), logger }
    }

    pub async fn get(&self, url: &str) -> reqwest::Result<reqwest::Response> {
        self.execute(reqwest::Method::GET, url, HeaderMap::new(), None).await
    }

    pub async fn post_json(&self, url: &str, headers: HeaderMap, body: Value) -> reqwest::Result<reqwest::Response> {
        self.execute(reqwest::Method::POST, url, headers, Some(body)).await
    }

    async fn execute(&self, method: reqwest::Method, url: &str, headers: HeaderMap, body: Option<Value>) -> reqwest::Result<reqwest::Response> {
        let Some(operation_id) = current_operation_id() else {
            let mut request = self.inner.request(method, url).headers(headers);
            if let Some(body) = body {
                request = request.json(&body);
            }
            return request.send().await;
        };

        let started = Instant::now();
        self.logger
            .log(
                &operation_id,
                "info",
                "http.request.start",
                json!({
                    "method": method.as_str(),
                    "url": url,
                    "headers": sanitize_headers(&headers),
                    "body": body.clone().unwrap_or(Value::Null),
                }),
            )
            .await;

        let mut request = self.inner.request(method.clone(), url).headers(headers);
        if let Some(body) = &body {
            request = request.json(body);
        }
        let result = request.send().await;
        let duration_ms = started.elapsed().as_millis();

        match result {
            Ok(response) => {
                let status = response.status();
                let response_headers = response.headers().clone();
                let bytes = response.bytes().await?;

                self.logger
                    .log(
                        &operation_id,
                        "info",
                        "http.request.end",
                        json!({
                            "method": method.as_str(),
                            "url": url,
                            "status": status.as_u16(),
                            "duration_ms": duration_ms,
                            "response_headers": sanitize_headers(&response_headers),
                            "response_body": truncated_body(&bytes),
                        }),
                    )
                    .await;

                let mut builder = http::Response::builder().status(status);
                *builder.headers_mut().unwrap() = response_headers;
                let restored = builder.body(bytes).expect("status/headers taken from a real response");
                Ok(reqwest::Response::from(restored))
            }
            Err(e) => {
                self.logger
                    .log(
                        &operation_id,
                        "error",
                        "http.request.error",
                        json!({ "method": method.as_str(), "url": url, "error": e.to_string(), "duration_ms": duration_ms }),
                    )
                    .await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_sensitive_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer secret".parse().unwrap());
        headers.insert("x-request-id", "abc".parse().unwrap());
        let sanitized = sanitize_headers(&headers);
        assert_eq!(sanitized["authorization"], json!("***"));
        assert_eq!(sanitized["x-request-id"], json!("abc"));
    }

    #[test]
    fn truncates_long_bodies() {
        let long = "x".repeat(MAX_LOGGED_BODY_BYTES + 100);
        let value = truncated_body(long.as_bytes());
        let shown = value.as_str().unwrap();
        assert!(shown.ends_with("... (truncated)"));
        assert!(shown.len() < long.len());
    }

    #[test]
    fn parses_json_bodies_when_not_truncated() {
        let body = br#"{"ok":true}"#;
        let value = truncated_body(body);
        assert_eq!(value, json!({ "ok": true }));
    }
}
