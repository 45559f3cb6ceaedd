//! Identity boundary
//!
//! Credentials are verified upstream (a reverse proxy or SSO gateway); this
//! layer only reads the identity it was handed.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use deckterm_types::Owner;

use super::error::AppError;
use super::routes::AppState;
use crate::cli::IdentityMode;
use crate::config::IdentityConfig;

pub const LOCAL_OWNER_ID: &str = "local";
pub const LOCAL_OWNER_EMAIL: &str = "local@localhost";

/// The authenticated caller of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(pub Owner);

/// Establish the caller's identity from request headers
pub fn identify(config: &IdentityConfig, headers: &HeaderMap) -> Result<Owner, AppError> {
    match config.mode {
        IdentityMode::None => Ok(Owner::new(LOCAL_OWNER_ID, LOCAL_OWNER_EMAIL)),
        IdentityMode::Headers => {
            let read = |name: &str| {
                headers
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            };
            let id = read(&config.user_id_header).ok_or_else(|| {
                AppError::Unauthorized(format!(
                    "Missing identity header '{}'",
                    config.user_id_header
                ))
            })?;
            let email = read(&config.user_email_header).unwrap_or_default();
            Ok(Owner::new(id, email))
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        identify(&state.identity, &parts.headers).map(Caller)
    }
}
