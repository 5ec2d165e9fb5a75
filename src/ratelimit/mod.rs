//! Sliding window admission control.

mod history;
mod limiter;
mod timestamp;

pub use history::{History, OutOfOrder};
pub use limiter::SlidingWindowLimiter;
pub use timestamp::Timestamp;
