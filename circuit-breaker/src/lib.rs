//! Circuit Breaker Library

pub mod cb;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod listener;
pub mod retry;
mod sim;
pub mod time;

pub use cb::*;
pub use circuit_breaker::*;
pub use config::*;
pub use error::*;
pub use listener::*;
pub use retry::*;
pub use time::*;
