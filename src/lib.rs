//! Slidewin - Per-Entity Sliding Window Admission Control
//!
//! This crate decides whether a request from a given entity fits within a
//! `capacity`-per-`window` budget, and records accepted request timestamps.
//! State is kept in process; timestamps are always supplied by the caller.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod replay;

pub use error::{OutOfOrderTimestamp, Result, SlidewinError};
pub use ratelimit::{SlidingWindowLimiter, Timestamp};
