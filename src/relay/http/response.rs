use crate::backend::ResponseData;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// The terminal JSON response shape: the HTTP status carries the code and
/// the body is the JSON encoding of the value, with an explicit length.
pub fn json_response<T: Serialize + ?Sized>(code: StatusCode, body: &T) -> Response {
    match serde_json::to_vec(body) {
        Ok(data) => {
            let length = data.len();
            let mut response = Response::new(Body::from(data));
            *response.status_mut() = code;
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

pub fn method_not_allowed(allow: Option<&'static str>) -> Response {
    let mut response = json_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    if let Some(allow) = allow {
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static(allow));
    }
    response
}

/// Replays a backend response to the client, headers and body verbatim.
pub fn forward_response(data: &ResponseData) -> Response {
    let mut response = Response::new(Body::from(data.body.clone()));
    *response.status_mut() = data.status;

    if let Some(content_type) = &data.content_type {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, content_type.clone());
    }
    if let Some(content_encoding) = &data.content_encoding {
        response
            .headers_mut()
            .insert(header::CONTENT_ENCODING, content_encoding.clone());
    }
    response
        .headers_mut()
        .insert(header::CONTENT_LENGTH, HeaderValue::from(data.body.len()));

    response
}
