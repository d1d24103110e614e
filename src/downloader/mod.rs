pub mod bulk;
pub mod rate_limit;
pub mod symbols;

pub use bulk::{BulkDownloader, DownloadConfig, SymbolSource};
pub use rate_limit::RateLimiter;
