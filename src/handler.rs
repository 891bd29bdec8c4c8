use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};

use crate::api::{
    CreateBookmarkRequest, HealthResponse, UpdateBookmarkRequest, bad_request, conflict, created, internal_error,
    no_content, not_found, success,
};
use crate::auth::{CurrentUser, IdentityProvider, SessionService, SignIn};
use crate::db::Database;
use crate::error::AuthError;
use crate::feed::FeedHub;
use crate::model::{Bookmark, BookmarkId, now};
use crate::store::{ChangeFeed, FeedFilter};
use crate::unpack_error;
use crate::validator::{BookmarkInput, validate};

pub const EXCHANGE_SECRET_HEADER: &str = "x-exchange-secret";

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub feed: FeedHub,
    pub auth: Arc<SessionService>,
    pub exchange_secret: Option<Arc<str>>,
}

pub async fn healthcheck() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

pub async fn list_bookmarks(State(state): State<AppState>, user: CurrentUser) -> Response {
    match state.db.list_bookmarks(user.id()).await {
        Ok(bookmarks) => success(bookmarks),
        Err(e) => {
            tracing::error!(user = %user.id(), error = %unpack_error(&*e), "failed to list bookmarks");
            internal_error("failed to list bookmarks")
        }
    }
}

pub async fn create_bookmark(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(payload): Json<CreateBookmarkRequest>,
) -> Response {
    let valid = match validate(&payload.input()) {
        Ok(valid) => valid,
        Err(e) => return bad_request(&e.to_string()),
    };

    let id = payload.id.unwrap_or_default();
    let bookmark = Bookmark {
        id,
        owner_id: user.id(),
        title: valid.title,
        url: valid.url,
        created_at: now(),
    };

    match state.db.insert_bookmark(&bookmark).await {
        Ok(true) => {
            tracing::info!(user = %user.id(), id = %bookmark.id, "bookmark created");
            created(bookmark)
        }
        Ok(false) => conflict("bookmark id already exists"),
        Err(e) => {
            tracing::error!(%id, error = %unpack_error(&*e), "failed to create bookmark");
            internal_error("failed to create bookmark")
        }
    }
}

pub async fn update_bookmark(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<BookmarkId>,
    Json(payload): Json<UpdateBookmarkRequest>,
) -> Response {
    let valid = match validate(&BookmarkInput::new(payload.title, payload.url)) {
        Ok(valid) => valid,
        Err(e) => return bad_request(&e.to_string()),
    };

    match state.db.update_bookmark(id, user.id(), &valid.title, &valid.url).await {
        Ok(Some(bookmark)) => success(bookmark),
        Ok(None) => not_found("bookmark not found"),
        Err(e) => {
            tracing::error!(%id, error = %unpack_error(&*e), "failed to update bookmark");
            internal_error("failed to update bookmark")
        }
    }
}

pub async fn delete_bookmark(State(state): State<AppState>, user: CurrentUser, Path(id): Path<BookmarkId>) -> Response {
    match state.db.delete_bookmark(id, user.id()).await {
        Ok(true) => {
            tracing::info!(user = %user.id(), %id, "bookmark deleted");
            no_content()
        }
        Ok(false) => not_found("bookmark not found"),
        Err(e) => {
            tracing::error!(%id, error = %unpack_error(&*e), "failed to delete bookmark");
            internal_error("failed to delete bookmark")
        }
    }
}

/// Server-sent stream of the caller's change events.
pub async fn bookmark_events(State(state): State<AppState>, user: CurrentUser) -> Response {
    let events = match state.feed.subscribe(FeedFilter::owner(user.id())) {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!(user = %user.id(), error = %e, "change feed subscription refused");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
    };

    tracing::info!(user = %user.id(), "change feed subscriber connected");
    let stream = events.map(|event| Event::default().event(event.kind()).json_data(&event));
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

fn secret_matches(expected: &str, presented: &str) -> bool {
    Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
}

pub async fn sign_in(State(state): State<AppState>, headers: HeaderMap, Json(assertion): Json<SignIn>) -> Response {
    let Some(expected) = state.exchange_secret.as_deref() else {
        return AuthError::ExchangeRejected.into_response();
    };
    let presented = headers
        .get(EXCHANGE_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !secret_matches(expected, presented) {
        tracing::warn!("session exchange with bad secret");
        return AuthError::ExchangeRejected.into_response();
    }

    match state.auth.sign_in(assertion).await {
        Ok(issued) => created(issued),
        Err(e) => e.into_response(),
    }
}

pub async fn sign_out(State(state): State<AppState>, user: CurrentUser) -> Response {
    match state.auth.sign_out(&user.token).await {
        Ok(()) => no_content(),
        Err(e) => e.into_response(),
    }
}

pub async fn me(user: CurrentUser) -> Response {
    success(user.principal)
}
