//! Request construction shared by the HTTP and streaming-HTTP transports.

use cardexec_core::HttpPayload;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Url;
use serde_json::json;

use crate::error::{HttpError, HttpResult};

/// JSON text of the payload params, `{}` when empty.
fn params_json(payload: &HttpPayload) -> HttpResult<String> {
    serde_json::to_string(&payload.params).map_err(|e| HttpError::InvalidRequest(e.to_string()))
}

/// Target URL. GET appends `params=<json>` after any existing query.
pub fn request_url(payload: &HttpPayload) -> HttpResult<Url> {
    let mut url = Url::parse(&payload.url)
        .map_err(|e| HttpError::InvalidRequest(format!("invalid url {:?}: {e}", payload.url)))?;

    if payload.method.is_get() {
        let params = params_json(payload)?;
        url.query_pairs_mut().append_pair("params", &params);
    }

    Ok(url)
}

/// Request body for non-GET methods: `{"params": "<json string>"}`.
pub fn request_body(payload: &HttpPayload) -> HttpResult<Option<String>> {
    if payload.method.is_get() {
        return Ok(None);
    }
    let params = params_json(payload)?;
    Ok(Some(json!({ "params": params }).to_string()))
}

/// Payload headers. Non-GET requests get `Content-Type: application/json`
/// unless one is already set under any casing.
pub fn request_headers(payload: &HttpPayload) -> HttpResult<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(payload.headers.len() + 1);

    for (name, value) in &payload.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| HttpError::InvalidRequest(format!("header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| HttpError::InvalidRequest(format!("header {name}: {e}")))?;
        headers.insert(name, value);
    }

    if !payload.method.is_get() && !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardexec_core::HttpMethod;
    use serde_json::Value;

    fn payload(method: HttpMethod, url: &str) -> HttpPayload {
        HttpPayload {
            method,
            url: url.to_string(),
            params: serde_json::from_value(json!({"id": 1, "q": "a b"})).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_get_appends_params_query() {
        let url = request_url(&payload(HttpMethod::Get, "http://api.test/cards")).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, "params");
        let params: Value = serde_json::from_str(&pairs[0].1).unwrap();
        assert_eq!(params, json!({"id": 1, "q": "a b"}));
    }

    #[test]
    fn test_get_keeps_existing_query() {
        let url = request_url(&payload(HttpMethod::Get, "http://api.test/cards?v=2")).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("v".to_string(), "2".to_string()));
        assert_eq!(pairs[1].0, "params");
    }

    #[test]
    fn test_empty_params_serialize_as_object() {
        let p = HttpPayload {
            url: "http://api.test/x".to_string(),
            ..Default::default()
        };
        let url = request_url(&p).unwrap();
        assert_eq!(url.query(), Some("params=%7B%7D"));
    }

    #[test]
    fn test_post_body_wraps_params_string() {
        let p = payload(HttpMethod::Post, "http://api.test/cards");
        assert_eq!(request_url(&p).unwrap().query(), None);

        let body: Value = serde_json::from_str(&request_body(&p).unwrap().unwrap()).unwrap();
        let inner = body["params"].as_str().expect("params is a JSON string");
        assert_eq!(serde_json::from_str::<Value>(inner).unwrap(), json!({"id": 1, "q": "a b"}));

        assert!(request_body(&payload(HttpMethod::Get, "http://x")).unwrap().is_none());
    }

    #[test]
    fn test_content_type_defaults_for_non_get() {
        let headers = request_headers(&payload(HttpMethod::Put, "http://x")).unwrap();
        assert_eq!(headers[CONTENT_TYPE], "application/json");

        let headers = request_headers(&payload(HttpMethod::Get, "http://x")).unwrap();
        assert!(!headers.contains_key(CONTENT_TYPE));
    }

    #[test]
    fn test_explicit_content_type_any_case_wins() {
        let mut p = payload(HttpMethod::Post, "http://x");
        p.headers.insert("content-TYPE".to_string(), "text/plain".to_string());
        p.headers.insert("Authorization".to_string(), "Bearer t".to_string());

        let headers = request_headers(&p).unwrap();
        assert_eq!(headers[CONTENT_TYPE], "text/plain");
        assert_eq!(headers["authorization"], "Bearer t");
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_invalid_url_and_header() {
        assert!(matches!(
            request_url(&payload(HttpMethod::Get, "not a url")),
            Err(HttpError::InvalidRequest(_))
        ));

        let mut p = payload(HttpMethod::Get, "http://x");
        p.headers.insert("bad header".to_string(), "v".to_string());
        assert!(matches!(request_headers(&p), Err(HttpError::InvalidRequest(_))));
    }
}
