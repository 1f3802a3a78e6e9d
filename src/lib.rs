//! laneforge - a lane-partitioned task queue and saga execution engine.
//!
//! # Features
//!
//! - **Lanes**: resource-partitioned task queues with rate limiting,
//!   backpressure, and an optional Redis-backed distributed mode with local
//!   fallback.
//! - **Saga orchestration**: DAG-based multi-step workflows with automatic,
//!   manual, or skip compensation policies, crash recovery, and a
//!   write-ahead log for durability.
//!
//! # Quick Start
//!
//! ```rust
//! use laneforge::{cli, server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cli = cli::parse_args();
//!     // Start the server with your configuration
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod core;
pub mod errors;
pub mod server;
pub mod storage;
pub mod telemetry;

pub use errors::{EngineError, Result};
