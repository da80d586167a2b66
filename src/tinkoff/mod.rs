pub mod client;
pub mod rate_limit;

pub use client::TinkoffClient;
pub use rate_limit::RateLimitTracker;
