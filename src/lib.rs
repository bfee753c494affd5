//! Streaming SQL statement digesting.
//!
//! A single forward pass turns a raw SQL statement into a digest: literals
//! become `?`, comments disappear (executable `/*! ... */` bodies are kept),
//! whitespace collapses, and long `IN (...)` lists shrink to `(?,?,?,...)`.
//! Two statements that differ only in parameter values share a digest, which
//! makes the digest a stable key for per-query statistics.
//!
//! The first `/* ... */` comment of a statement is captured on the side so
//! upstream systems can use it for routing hints.
//!
//! The scanner works on bytes, not code points, and never fails: every byte
//! sequence produces a well-formed output.

pub mod classify;
pub mod config;
pub mod digest;
pub mod strip;

pub use config::DigestConfig;
pub use digest::{
    bytes_scanned, query_digest, query_digest_into, Digest, FIRST_COMMENT_MAX_LENGTH,
};
pub use strip::strip_comments;
