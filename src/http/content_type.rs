use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use crate::activity_pub::{AS_CONTEXT, BLOCKED_CONTEXT, SECURITY_CONTEXT};

/// ActivityStreams payloads go out as `application/activity+json`.
pub(crate) struct ActivityJson(pub(crate) StatusCode, pub(crate) Json<Value>);

impl IntoResponse for ActivityJson {
    fn into_response(self) -> Response {
        let ActivityJson(status, json) = self;
        let mut response = (status, json).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/activity+json; charset=utf-8"),
        );
        response
    }
}

/// WebFinger speaks JRD.
pub(crate) struct JrdJson(pub(crate) Json<Value>);

impl IntoResponse for JrdJson {
    fn into_response(self) -> Response {
        let mut response = self.0.into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/jrd+json; charset=utf-8"),
        );
        response
    }
}

/// Stamp the JSON-LD `@context` this server speaks onto an outgoing value.
pub(crate) fn with_context(mut value: Value) -> Value {
    if let Some(map) = value.as_object_mut() {
        map.insert(
            "@context".to_string(),
            json!([AS_CONTEXT, SECURITY_CONTEXT, BLOCKED_CONTEXT]),
        );
    }
    value
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::with_context;

    #[test]
    fn context_carries_all_three_vocabularies() {
        let value = with_context(json!({"type": "Note"}));
        let context = value.get("@context").unwrap();
        assert_eq!(
            context,
            &json!([
                "https://www.w3.org/ns/activitystreams",
                "https://w3id.org/security",
                "https://purl.archive.org/socialweb/blocked"
            ])
        );
    }
}
