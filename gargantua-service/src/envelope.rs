// Copyright 2025 The Gargantua Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The JSON envelope every gateway response is wrapped in.
//!
//! Successful responses carry the base64 encoded JSON body as `content`;
//! failures carry a human readable `message`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use gargantua_error::{Code, Error, make_input_err};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub status: u16,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

pub const fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::InvalidArgument | Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::FailedPrecondition | Code::Aborted => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn kind_of(status: StatusCode) -> &'static str {
    match status {
        StatusCode::OK => "success",
        StatusCode::CREATED => "created",
        StatusCode::BAD_REQUEST => "badrequest",
        StatusCode::UNAUTHORIZED => "unauthorized",
        StatusCode::FORBIDDEN => "forbidden",
        StatusCode::NOT_FOUND => "notfound",
        StatusCode::CONFLICT => "conflict",
        _ => "error",
    }
}

/// Wraps `body` in a success envelope.
pub fn content<T: Serialize>(status: StatusCode, body: &T) -> Result<Response, ApiError> {
    let encoded = serde_json::to_vec(body)?;
    let envelope = Envelope {
        status: status.as_u16(),
        kind: kind_of(status).to_string(),
        message: None,
        content: Some(STANDARD.encode(encoded)),
    };
    Ok((status, Json(envelope)).into_response())
}

/// Decodes the `content` of a success envelope.
pub fn decode_content<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, Error> {
    let encoded = envelope
        .content
        .as_deref()
        .ok_or_else(|| make_input_err!("Envelope has no content"))?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| make_input_err!("Envelope content is not base64: {e}"))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// An `Error` on its way out of a handler.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = http_status(self.0.code);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!(err = ?self.0, "Gateway request failed");
        }
        let envelope = Envelope {
            status: status.as_u16(),
            kind: kind_of(status).to_string(),
            message: Some(self.0.message_string()),
            content: None,
        };
        (status, Json(envelope)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use gargantua_error::Code;
    use pretty_assertions::assert_eq;

    use super::{Envelope, content, decode_content, http_status};

    #[test]
    fn codes_map_onto_gateway_statuses() {
        assert_eq!(http_status(Code::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(http_status(Code::Unauthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(http_status(Code::PermissionDenied), StatusCode::FORBIDDEN);
        assert_eq!(http_status(Code::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(http_status(Code::FailedPrecondition), StatusCode::CONFLICT);
        assert_eq!(http_status(Code::Unavailable), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn content_is_base64_json() {
        let response = content(StatusCode::CREATED, &vec!["a", "b"]).unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let envelope = Envelope {
            status: 201,
            kind: "created".to_string(),
            message: None,
            content: Some("WyJhIiwiYiJd".to_string()),
        };
        let decoded: Vec<String> = decode_content(&envelope).unwrap();
        assert_eq!(decoded, vec!["a", "b"]);
    }
}
