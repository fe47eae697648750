// Proxy core: translation, scheduling, and the HTTP surface.

pub mod accounts;
pub mod config;
pub mod error;
pub mod project_resolver;
pub mod rate_limit;
pub mod scheduler;
pub mod signature_cache;
pub mod sticky;
pub mod token_registry;

pub mod common;
pub mod handlers;
pub mod mappers;
pub mod middleware;
pub mod server;
pub mod upstream;

pub use accounts::AccountStore;
pub use config::ProxyConfig;
pub use error::{ProxyError, ProxyResult};
pub use scheduler::Scheduler;
pub use server::AxumServer;
pub use signature_cache::SignatureCache;
