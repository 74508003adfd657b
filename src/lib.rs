#![forbid(unsafe_code)]

//! Shared library behind the savetube binaries.
//!
//! The HTTP server and the cron sweep helper both go through the retention
//! store defined here, so artifact bookkeeping lives in exactly one place.

pub mod config;
pub mod formats;
pub mod media;
pub mod retention;
pub mod security;
pub mod storage;
pub mod tools;
