// Domain models: raw samples on the wire, enriched records in history

mod metric;
mod record;

pub use metric::Metric;
pub use record::{MetricRecord, Rates};
