use axum::{
    extract::rejection::JsonRejection,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use deckterm_types::TerminalError;

/// Error returned by HTTP handlers
#[derive(Debug)]
pub enum AppError {
    Terminal(TerminalError),
    /// No identity could be established for the caller
    Unauthorized(String),
    BadRequest(String),
    /// The companion service could not be reached or failed
    BadGateway(String),
    Internal(anyhow::Error),
}

impl From<TerminalError> for AppError {
    fn from(err: TerminalError) -> Self {
        AppError::Terminal(err)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Terminal(err) => match err {
                TerminalError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
                TerminalError::SpawnFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
                TerminalError::NotFound(_) => StatusCode::NOT_FOUND,
                TerminalError::Forbidden(_) => StatusCode::FORBIDDEN,
                TerminalError::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                TerminalError::TransportClosed => StatusCode::BAD_GATEWAY,
            },
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            AppError::Terminal(err) => err.reason(),
            AppError::Unauthorized(_) => "unauthorized",
            AppError::BadRequest(_) => "bad_request",
            AppError::BadGateway(_) => "upstream_error",
            AppError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let reason = self.reason();
        let message = match &self {
            AppError::Terminal(err) => err.to_string(),
            AppError::Unauthorized(msg) | AppError::BadRequest(msg) | AppError::BadGateway(msg) => {
                msg.clone()
            }
            AppError::Internal(err) => format!("{:#}", err),
        };
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), reason, message = %message, "request failed");
        }

        let body = Json(serde_json::json!({
            "error": reason,
            "message": message,
            "status": status.as_u16(),
        }));
        let mut response = (status, body).into_response();

        if let AppError::Terminal(TerminalError::UpstreamUnavailable { retry_after }) = &self {
            // Round up so clients never retry before the breaker allows a probe
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
