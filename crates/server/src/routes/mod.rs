pub mod auth;
pub mod monitor;
