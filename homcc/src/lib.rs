//! homcc client library.
//!
//! The `homcc` binary is a thin wrapper over these modules; keeping them in
//! a library target lets integration tests drive a full client session
//! against an in-process server.

#![forbid(unsafe_code)]

pub mod deps;
pub mod error;
pub mod selection;
pub mod session;
pub mod slots;

pub use error::ClientError;
