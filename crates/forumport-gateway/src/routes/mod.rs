//! HTTP route handlers.

pub mod health;
pub mod redirect;
pub mod translation;
