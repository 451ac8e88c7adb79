//! JSON-over-HTTP read API for the companion dashboard.

mod handlers;
mod routes;

pub use handlers::AppState;
pub use routes::control_router;
