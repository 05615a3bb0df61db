pub use app_error::{AppError, AppResult};
pub use config::{
    CheckpointConfig, CoordinatorConfig, EventHubConfig, PartitionConfig, ReceiverConfig,
    RetryConfig, SchemeConfig, SourceConfig, SpoutConfig, StartPositionKind, StoreKind,
    TracingConfig,
};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod config;
mod shutdown;
mod tracing_config;
