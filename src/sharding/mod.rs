pub mod service;
pub mod strategy;

pub use service::ShardingService;
pub use strategy::{AverageAllocationStrategy, OdevitySortedStrategy, ShardingStrategy, ShardingStrategyKind};
