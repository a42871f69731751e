pub mod app;
pub mod config;
pub mod error;
pub mod extract;
pub mod lifecycle;
pub mod routes;
pub mod state_factory;

pub use app::{AppState, build_router};
pub use config::Settings;
pub use error::ServerError;
