mod cache;
mod engine;
mod strategy;

pub use cache::AnalyticsCache;
pub use engine::{
    AnalyticsEngine, DataQuery, DistributionEntry, Page, SortOrder, TimeSeriesPoint, TopEntry,
};
pub use strategy::{Period, SheetStrategy, TopMetric, strategy_for};
