pub mod collector;
pub mod models;
pub mod request;
pub mod response;
pub mod streaming;
pub mod thinking;

pub use collector::collect_upstream_sse_response;
pub use request::translate_request_in;
pub use response::translate_response_out;
pub use streaming::create_claude_sse_stream;
