pub mod arbiter;
pub mod firehose;
pub mod processor;
pub mod querier;

pub use arbiter::NodeArbiter;
pub use firehose::Firehose;
pub use processor::EventProcessor;
pub use querier::PubkeyQuerier;
