//! Integration tests: full passes over mocked sources, and the HTTP
//! clients against local servers.

mod http;
mod mock_sources;
mod pipeline;
