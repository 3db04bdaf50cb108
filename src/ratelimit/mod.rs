//! Fixed window rate limiting logic.

mod key;
mod limiter;
mod window;

pub use key::{BucketKey, KEY_SEPARATOR};
pub use limiter::{FixedWindowRateLimiter, WindowStatus};
pub use window::{
    BucketStrategy, Clock, Granularity, ManualClock, SystemClock, MAX_PERIOD, MIN_PERIOD,
};
