//! HTTP surface over the sandbox core.

pub mod http;

pub use http::Server;
