pub mod checkpoint;
pub mod coordinator;
pub mod event;
pub mod frontend;
pub mod metrics;
pub mod partition;
pub mod reader;
mod service;
pub mod utils;

pub use checkpoint::{
    CheckpointKeyspace, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
    RocksDbCheckpointStore, StoreError,
};
pub use coordinator::{Assignment, AssignmentStrategy, PartitionCoordinator};
pub use event::{EventData, EventDataScheme, MessageId, ReceivedMessage, SchemeKind};
pub use frontend::IngestionFrontend;
pub use partition::{
    DeadLetterHandler, DeadLetterMode, InFlightTracker, PartitionManager, PartitionSettings,
    PartitionStatus, PendingMessage, TrackError,
};
pub use reader::{
    ConnectError, FetchError, FileLogClient, LogClient, LogConnection, MemoryLogClient,
    PartitionReader, StartPosition,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, CheckpointConfig, CoordinatorConfig,
    EventHubConfig, PartitionConfig, ReceiverConfig, RetryConfig, SchemeConfig, Shutdown,
    SourceConfig, SpoutConfig, StartPositionKind, StoreKind, TracingConfig, TracingGuard,
};
