use axum::{
    Router,
    routing::{delete, get, post, put},
};

use crate::handler::{self, AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(handler::healthcheck))
        .route("/auth/session", post(handler::sign_in))
        .route("/auth/session", delete(handler::sign_out))
        .route("/auth/me", get(handler::me))
        .route("/bookmarks", get(handler::list_bookmarks))
        .route("/bookmarks", post(handler::create_bookmark))
        .route("/bookmarks/events", get(handler::bookmark_events))
        .route("/bookmarks/:id", put(handler::update_bookmark))
        .route("/bookmarks/:id", delete(handler::delete_bookmark))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request, StatusCode, header},
        response::Response,
    };
    use futures_util::StreamExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::auth::SessionService;
    use crate::db::Database;
    use crate::feed::FeedHub;
    use crate::handler::EXCHANGE_SECRET_HEADER;
    use crate::model::{ChangeEvent, OwnerId};
    use crate::store::{ChangeFeed, FeedFilter};

    const SECRET: &str = "gateway-secret";

    struct Harness {
        _dir: tempfile::TempDir,
        app: Router,
        feed: FeedHub,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let feed = FeedHub::new(16);
        let db = Arc::new(
            Database::open_local(&dir.path().join("routes.db"), feed.clone())
                .await
                .unwrap(),
        );
        let state = AppState {
            auth: Arc::new(SessionService::new(db.clone(), 1)),
            db,
            feed: feed.clone(),
            exchange_secret: Some(Arc::from(SECRET)),
        };

        Harness {
            _dir: dir,
            app: routes().with_state(state),
            feed,
        }
    }

    async fn send(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .header(EXCHANGE_SECRET_HEADER, SECRET)
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.clone().oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn sign_in(app: &Router, subject: &str) -> (String, OwnerId) {
        let response = send(
            app,
            Method::POST,
            "/auth/session",
            None,
            Some(json!({"subject": subject, "email": format!("{subject}@example.com")})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        let token = body["data"]["token"].as_str().unwrap().to_string();
        let owner = body["data"]["user"]["id"].as_str().unwrap().parse().unwrap();
        (token, owner)
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let h = harness().await;
        let response = send(&h.app, Method::GET, "/", None, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_bookmarks_require_session() {
        let h = harness().await;
        let response = send(&h.app, Method::GET, "/bookmarks", None, None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = send(&h.app, Method::GET, "/bookmarks", Some("made-up"), None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_exchange_requires_secret() {
        let h = harness().await;
        let request = Request::builder()
            .method(Method::POST)
            .uri("/auth/session")
            .header(header::CONTENT_TYPE, "application/json")
            .header(EXCHANGE_SECRET_HEADER, "wrong")
            .body(Body::from(json!({"subject": "s", "email": "e@example.com"}).to_string()))
            .unwrap();
        let response = h.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_create_list_delete() {
        let h = harness().await;
        let (token, owner) = sign_in(&h.app, "google|1").await;

        let response = send(
            &h.app,
            Method::POST,
            "/bookmarks",
            Some(&token),
            Some(json!({"title": "  Tokio  ", "url": "https://tokio.rs"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = json_body(response).await["data"].clone();
        assert_eq!(created["title"], "Tokio");
        assert_eq!(created["url"], "https://tokio.rs/");
        assert_eq!(created["user_id"], owner.to_string());

        let response = send(&h.app, Method::GET, "/bookmarks", Some(&token), None).await;
        let listed = json_body(response).await;
        assert_eq!(listed["data"].as_array().unwrap().len(), 1);

        let uri = format!("/bookmarks/{}", created["id"].as_str().unwrap());
        let response = send(&h.app, Method::DELETE, &uri, Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = send(&h.app, Method::DELETE, &uri, Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_input() {
        let h = harness().await;
        let (token, _) = sign_in(&h.app, "google|1").await;

        let response = send(
            &h.app,
            Method::POST,
            "/bookmarks",
            Some(&token),
            Some(json!({"title": "A", "url": "ftp://example.com"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "unsupported scheme");
    }

    #[tokio::test]
    async fn test_client_chosen_id_is_kept_and_unique() {
        let h = harness().await;
        let (token, _) = sign_in(&h.app, "google|1").await;
        let id = "00000000-0000-4000-8000-000000000001";
        let body = json!({"id": id, "title": "A", "url": "http://a"});

        let response = send(&h.app, Method::POST, "/bookmarks", Some(&token), Some(body.clone())).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json_body(response).await["data"]["id"], id);

        let response = send(&h.app, Method::POST, "/bookmarks", Some(&token), Some(body)).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_concurrent_creates_with_same_id_conflict() {
        let h = harness().await;
        let (token, owner) = sign_in(&h.app, "google|1").await;
        let body = json!({"id": "00000000-0000-4000-8000-000000000002", "title": "A", "url": "http://a"});

        let (first, second) = tokio::join!(
            send(&h.app, Method::POST, "/bookmarks", Some(&token), Some(body.clone())),
            send(&h.app, Method::POST, "/bookmarks", Some(&token), Some(body.clone())),
        );
        let mut statuses = [first.status(), second.status()];
        statuses.sort();
        assert_eq!(statuses, [StatusCode::CREATED, StatusCode::CONFLICT]);

        let response = send(&h.app, Method::GET, "/bookmarks", Some(&token), None).await;
        let listed = json_body(response).await;
        assert_eq!(listed["data"].as_array().unwrap().len(), 1);
        assert_eq!(listed["data"][0]["user_id"], owner.to_string());
    }

    #[tokio::test]
    async fn test_owners_are_isolated() {
        let h = harness().await;
        let (alice, _) = sign_in(&h.app, "google|alice").await;
        let (bob, _) = sign_in(&h.app, "google|bob").await;

        let response = send(
            &h.app,
            Method::POST,
            "/bookmarks",
            Some(&alice),
            Some(json!({"title": "A", "url": "http://a"})),
        )
        .await;
        let id = json_body(response).await["data"]["id"].as_str().unwrap().to_string();

        let listed = json_body(send(&h.app, Method::GET, "/bookmarks", Some(&bob), None).await).await;
        assert!(listed["data"].as_array().unwrap().is_empty());

        let response = send(&h.app, Method::DELETE, &format!("/bookmarks/{id}"), Some(&bob), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_emits_feed_event() {
        let h = harness().await;
        let (token, owner) = sign_in(&h.app, "google|1").await;
        let mut events = h.feed.subscribe(FeedFilter::owner(owner)).unwrap();

        let response = send(
            &h.app,
            Method::POST,
            "/bookmarks",
            Some(&token),
            Some(json!({"title": "A", "url": "http://a"})),
        )
        .await;
        let id = json_body(response).await["data"]["id"].as_str().unwrap().to_string();
        assert!(matches!(events.next().await, Some(ChangeEvent::Insert { .. })));

        let response = send(
            &h.app,
            Method::PUT,
            &format!("/bookmarks/{id}"),
            Some(&token),
            Some(json!({"title": "B", "url": "http://b"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        match events.next().await {
            Some(ChangeEvent::Update { record }) => {
                assert_eq!(record.title, "B");
                assert_eq!(record.url, "http://b/");
            }
            other => panic!("expected update event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sign_out_revokes_token() {
        let h = harness().await;
        let (token, owner) = sign_in(&h.app, "google|1").await;

        let me = json_body(send(&h.app, Method::GET, "/auth/me", Some(&token), None).await).await;
        assert_eq!(me["data"]["id"], owner.to_string());

        let response = send(&h.app, Method::DELETE, "/auth/session", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = send(&h.app, Method::GET, "/auth/me", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_event_stream_is_sse() {
        let h = harness().await;
        let (token, _) = sign_in(&h.app, "google|1").await;

        let response = send(&h.app, Method::GET, "/bookmarks/events", Some(&token), None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
    }
}
