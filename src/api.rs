use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::model::BookmarkId;
use crate::validator::BookmarkInput;

#[derive(Debug, Deserialize)]
pub struct CreateBookmarkRequest {
    /// Client-chosen id from an optimistic add; the server picks one if absent.
    #[serde(default)]
    pub id: Option<BookmarkId>,
    pub title: String,
    pub url: String,
}

impl CreateBookmarkRequest {
    pub fn input(&self) -> BookmarkInput {
        BookmarkInput::new(self.title.as_str(), self.url.as_str())
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateBookmarkRequest {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub fn success<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse { data })).into_response()
}

pub fn created<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(ApiResponse { data })).into_response()
}

pub fn no_content() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

fn error(status: StatusCode, msg: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: msg.to_string(),
        }),
    )
        .into_response()
}

pub fn not_found(msg: &str) -> Response {
    error(StatusCode::NOT_FOUND, msg)
}

pub fn bad_request(msg: &str) -> Response {
    error(StatusCode::BAD_REQUEST, msg)
}

pub fn conflict(msg: &str) -> Response {
    error(StatusCode::CONFLICT, msg)
}

pub fn internal_error(msg: &str) -> Response {
    error(StatusCode::INTERNAL_SERVER_ERROR, msg)
}
