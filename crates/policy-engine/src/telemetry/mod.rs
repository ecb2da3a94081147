pub mod log;
pub mod metrics;

pub use log::{LogFormat, init as init_logging};
pub use metrics::Metrics;
