// Axum middleware.

pub mod cors;

pub use cors::cors_layer;
