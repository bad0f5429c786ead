//! User registration and listing.
//!
//! Users are kept behind the [`UserStore`] trait. The server ships with an
//! in-memory store; records live for the lifetime of the process.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::auth::Authenticated;
use crate::error::ApiError;
use crate::handlers::AppState;
use crate::metrics;

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Sequential id, starting at 1.
    pub id: u64,
    /// Unique name.
    pub name: String,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

/// User service errors.
#[derive(Debug, Error)]
pub enum UserError {
    /// Empty or missing name.
    #[error("Name is required")]
    NameRequired,

    /// Name already taken.
    #[error("User with name '{0}' already exists")]
    Duplicate(String),

    /// Backing store failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Storage for user records.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Create a user with the given name.
    async fn create(&self, name: &str) -> Result<User, UserError>;

    /// All users in registration order.
    async fn find_all(&self) -> Result<Vec<User>, UserError>;

    /// Users whose name matches exactly.
    async fn find_by_name(&self, name: &str) -> Result<Vec<User>, UserError>;
}

/// In-memory user store.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: RwLock<Vec<User>>,
}

impl MemoryUserStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create(&self, name: &str) -> Result<User, UserError> {
        let mut users = self.users.write().await;
        if users.iter().any(|u| u.name == name) {
            return Err(UserError::Duplicate(name.to_string()));
        }

        let user = User {
            id: users.len() as u64 + 1,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        users.push(user.clone());
        Ok(user)
    }

    async fn find_all(&self) -> Result<Vec<User>, UserError> {
        Ok(self.users.read().await.clone())
    }

    async fn find_by_name(&self, name: &str) -> Result<Vec<User>, UserError> {
        Ok(self
            .users
            .read()
            .await
            .iter()
            .filter(|u| u.name == name)
            .cloned()
            .collect())
    }
}

/// Validates requests and delegates to a [`UserStore`].
#[derive(Clone)]
pub struct UserService {
    store: Arc<dyn UserStore>,
}

impl UserService {
    /// Create a service over a store.
    #[must_use]
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }

    /// Register a new user.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is missing, taken, or the store fails.
    pub async fn register(&self, name: Option<&str>) -> Result<User, UserError> {
        let name = name.filter(|n| !n.is_empty()).ok_or(UserError::NameRequired)?;
        self.store.create(name).await
    }

    /// List users, optionally filtered by exact name.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn list(&self, search: Option<&str>) -> Result<Vec<User>, UserError> {
        match search.filter(|s| !s.is_empty()) {
            Some(name) => self.store.find_by_name(name).await,
            None => self.store.find_all().await,
        }
    }
}

/// Body of `POST /users/register`.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub name: Option<String>,
}

/// Response of `POST /users/register`.
#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub message: &'static str,
    pub user: User,
    pub token: String,
}

/// Query of `GET /users/alluser`.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub search: Option<String>,
}

/// Entry of the `GET /users/alluser` response.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSummary {
    pub id: u64,
    pub name: String,
}

impl From<User> for UserSummary {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
        }
    }
}

/// Routes mounted under `/users`.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/register", post(register_handler))
        .route("/alluser", get(list_handler))
}

async fn register_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let user = state.users.register(request.name.as_deref()).await?;
    let token = state.tokens.issue(&user).map_err(|e| {
        error!(error = %e, "Failed to sign token");
        ApiError::from(e)
    })?;

    metrics::user_registered();
    info!(user_id = user.id, name = %user.name, "User registered");

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "User registered successfully",
            user,
            token,
        }),
    ))
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    Authenticated(claims): Authenticated,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<UserSummary>>, ApiError> {
    let users = state.users.list(query.search.as_deref()).await.map_err(|e| {
        error!(requested_by = claims.id, error = %e, "Failed to list users");
        ApiError::from(e)
    })?;

    Ok(Json(users.into_iter().map(UserSummary::from).collect()))
}
