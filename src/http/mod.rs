//! HTTP boundary: caller identification, rate limit headers, route guards
//! and the standalone decision service.

pub mod client_ip;
pub mod guard;
pub mod headers;
mod server;
mod service;

pub use client_ip::client_ip;
pub use guard::{enforce, too_many_requests, Guard};
pub use server::HttpServer;
pub use service::{router, AppState, CheckRequest};
