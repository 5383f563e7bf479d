//! Rate limiting logic and state management.

mod backend;
mod bucket;
pub mod clock;
mod decision;
mod key;
mod limiter;
pub mod memory;
pub mod policy;
pub mod upstash;

pub use backend::{BackendKind, RateLimiterBackend};
pub use bucket::Bucket;
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::Decision;
pub use key::{validate_action, RateLimitKey};
pub use limiter::{FailurePolicy, RateLimiter};
pub use memory::MemoryRateLimiter;
pub use policy::{ActionPolicy, PolicySet};
pub use upstash::{UpstashConfig, UpstashRateLimiter};
