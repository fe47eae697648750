pub mod client;

pub use client::{UpstreamCallError, UpstreamClient};
