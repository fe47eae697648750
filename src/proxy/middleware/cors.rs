use tower_http::cors::{Any, CorsLayer};

/// Permissive CORS: the proxy fronts local tooling and IDE clients on
/// arbitrary origins.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}
