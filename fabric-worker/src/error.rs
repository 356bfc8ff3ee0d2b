use fabric_common::broker::BrokerError;
use thiserror::Error;

/// Errors surfaced by the worker process itself (as opposed to the
/// taxonomy errors individual jobs produce).
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid worker configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Fabric(#[from] fabric_common::Error),
    #[error("a broker operation failed: {0}")]
    Broker(#[from] BrokerError),
    #[error("worker pool failed to drain before the shutdown deadline")]
    ShutdownTimeout,
}
