//! Network transport shared by all provider adapters

pub mod http;

pub use http::HttpTransport;
