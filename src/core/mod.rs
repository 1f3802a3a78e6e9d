pub mod checkpoint;
pub mod cleanup;
pub mod compensation;
pub mod events;
pub mod fallback_lane;
pub mod lane;
pub mod lane_manager;
pub mod orchestrator;
pub mod ownership;
pub mod priority_queue;
pub mod rate_limiter;
pub mod recovery;
pub mod redis_lane;
pub mod saga;
pub mod saga_store;
pub mod task;
pub mod wal;
pub mod worker_pool;

pub use lane::{ChannelLane, LaneHandle};
pub use lane_manager::LaneManager;
pub use orchestrator::SagaOrchestrator;
pub use ownership::OwnershipCoordinator;
pub use recovery::RecoveryManager;
pub use saga::{SagaBuilder, SagaDefinition, SagaInstance, SagaState, Step};
pub use saga_store::SagaStore;
pub use wal::Wal;
