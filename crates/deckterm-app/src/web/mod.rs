// HTTP and streaming frontend
pub mod auth;
pub mod error;
pub mod routes;
pub mod server;
pub mod upstream;

pub use auth::Caller;
pub use error::AppError;
pub use routes::{create_router, AppState};
pub use server::WebServer;
pub use upstream::{BreakerState, CircuitBreaker, UpstreamProxy};
