//! Pieces shared across the Proxima backend: the error taxonomy and its
//! wire envelope, session token types, request middleware and the
//! Postgres pool.

pub mod clients;
pub mod errors;
pub mod middleware;
pub mod types;

pub use errors::{AppError, AppResult, ErrorCode};
