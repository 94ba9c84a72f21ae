pub mod aggregator;
pub mod config;
pub mod discovery;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod payload;
pub mod rate_limiter;
pub mod report;
pub mod sampler;
#[cfg(feature = "scripting")]
pub mod script;
pub mod shutdown;
pub mod stats;
pub mod targets;
pub mod transport;
pub mod trend;

pub use aggregator::*;
pub use config::*;
pub use discovery::*;
pub use dispatcher::*;
pub use engine::*;
pub use error::*;
pub use metrics::*;
pub use payload::*;
pub use rate_limiter::*;
pub use report::*;
pub use sampler::*;
#[cfg(feature = "scripting")]
pub use script::*;
pub use shutdown::*;
pub use stats::*;
pub use targets::*;
pub use transport::*;
pub use trend::*;
