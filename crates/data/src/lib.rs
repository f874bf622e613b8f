pub mod cache;
pub mod rate_limit;
pub mod upstream;

pub use cache::Cache;
pub use rate_limit::RateLimiter;
pub use upstream::{HttpUpstream, UpstreamClient};
