pub mod config;
pub mod duration;

pub use config::NodepoolConfig;
pub use duration::parse_duration;
