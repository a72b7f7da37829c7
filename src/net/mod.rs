//! Application-layer plumbing used over circuit streams: a minimal
//! HTTP/1.x client and TLS wrapping for https destinations.

pub mod http;
pub mod tls;
