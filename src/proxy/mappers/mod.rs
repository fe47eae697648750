// Protocol translation between the Anthropic Messages API and the Cloud
// Code v1internal content/parts schema.

pub mod claude;
pub mod sse_collector;
