//! Session-based identity.
//!
//! The OAuth handshake happens upstream of this service: a trusted sign-in
//! gateway verifies the user with the identity provider and exchanges the
//! verified subject for an opaque session token here. Every bookmark route
//! then resolves the bearer token to a [`Principal`].

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::Database;
use crate::error::AuthError;
use crate::handler::AppState;
use crate::model::OwnerId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: OwnerId,
    pub email: String,
}

/// An identity assertion already verified by the upstream provider.
#[derive(Debug, Clone, Deserialize)]
pub struct SignIn {
    pub subject: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedSession {
    pub token: String,
    pub user: Principal,
    pub expires_at: DateTime<Utc>,
}

pub trait IdentityProvider {
    fn sign_in(&self, assertion: SignIn) -> impl Future<Output = Result<IssuedSession, AuthError>> + Send;

    fn sign_out(&self, token: &str) -> impl Future<Output = Result<(), AuthError>> + Send;

    fn current_user(&self, token: &str) -> impl Future<Output = Result<Option<Principal>, AuthError>> + Send;
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub struct SessionService {
    db: Arc<Database>,
    ttl: Duration,
}

impl SessionService {
    pub fn new(db: Arc<Database>, ttl_hours: i64) -> Self {
        Self {
            db,
            ttl: Duration::hours(ttl_hours.max(1)),
        }
    }

    pub async fn purge_expired(&self) -> anyhow::Result<u64> {
        self.db.purge_expired_sessions(&Utc::now()).await
    }
}

impl IdentityProvider for SessionService {
    async fn sign_in(&self, assertion: SignIn) -> Result<IssuedSession, AuthError> {
        let subject = assertion.subject.trim();
        let email = assertion.email.trim();
        if subject.is_empty() || email.is_empty() {
            return Err(AuthError::ExchangeRejected);
        }

        let user = self
            .db
            .upsert_user(subject, email)
            .await
            .map_err(AuthError::Provider)?;

        let token = Uuid::new_v4().simple().to_string();
        let created_at = Utc::now();
        let expires_at = created_at + self.ttl;
        self.db
            .create_session(&hash_token(&token), user.id, &created_at, &expires_at)
            .await
            .map_err(AuthError::Provider)?;

        tracing::info!(user = %user.id, "session issued");
        Ok(IssuedSession {
            token,
            user,
            expires_at,
        })
    }

    async fn sign_out(&self, token: &str) -> Result<(), AuthError> {
        let removed = self
            .db
            .delete_session(&hash_token(token))
            .await
            .map_err(AuthError::Provider)?;
        if !removed {
            return Err(AuthError::InvalidSession);
        }
        Ok(())
    }

    async fn current_user(&self, token: &str) -> Result<Option<Principal>, AuthError> {
        self.db
            .find_session_user(&hash_token(token), &Utc::now())
            .await
            .map_err(AuthError::Provider)
    }
}

pub fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// The signed-in caller. Rejects with 401 when the token is missing,
/// unknown or expired.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub principal: Principal,
    pub token: String,
}

impl CurrentUser {
    pub fn id(&self) -> OwnerId {
        self.principal.id
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(AuthError::MissingToken)?.to_string();
        let principal = state
            .auth
            .current_user(&token)
            .await?
            .ok_or(AuthError::InvalidSession)?;

        Ok(CurrentUser { principal, token })
    }
}
