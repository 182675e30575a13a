//! A staged event-driven dispatch engine.
//!
//! Work items ("contexts") are pushed into named stages. Each stage owns a set
//! of bounded queues and a pool of worker threads running one handler, so
//! producers are decoupled from consumers and memory is bounded by queue
//! capacity.
//!
//! # Features
//!
//! - Per-key FIFO: contexts sharing a scheduling key land on the same queue
//! - Shortest-queue placement for unkeyed contexts (brute or partitioned search)
//! - Flush barrier: a context that visits every queue of a stage before running
//! - Blocking `put` as the only backpressure mechanism
//! - Stage manager with a one-shot start gate and a state-driven controller
//! - Ordered sink, direct (inline) execution and cross-stage trace monitoring
//!
//! # Example
//!
//! ```ignore
//! use stage_dispatch::{DispatchConfig, FnHandler, Sink, StageManager};
//!
//! let manager = StageManager::new(DispatchConfig::from_env());
//! let stage = manager.create_stage::<u64, _>(
//!     "apply",
//!     FnHandler::new(|txn: u64| {
//!         println!("applying {txn}");
//!         Ok(())
//!     }),
//!     4,
//!     1024,
//! )?;
//!
//! manager.start_all(&manager.context(), &[], &[])?;
//! stage.add_single_threaded(42)?;
//! manager.stop_all()?;
//! ```

pub mod config;
pub mod context;
pub mod controller;
pub mod direct;
pub mod error;
pub mod handler;
pub mod manager;
pub mod monitor;
pub mod ordered;
pub mod queue;
pub mod sink;
pub mod stage;
pub mod stage_queue;
pub mod stats;
pub mod thread_group;

pub use config::{DispatchConfig, FindStrategy, StageOverrides};
pub use context::{EventContext, Scheduling, SchedulingKey, Specialized, SpecializedEvent};
pub use controller::StageController;
pub use direct::{DirectActivation, DirectSink};
pub use error::{DispatchError, HandlerError, Result};
pub use handler::{ConfigurationContext, EventHandler, FnHandler, PostInit};
pub use manager::StageManager;
pub use monitor::{CollectingConsumer, LogConsumer, Phase, PipelineMonitor, TraceConsumer, TraceRecord};
pub use ordered::{OrderedSink, Sequenced};
pub use queue::{BlockingQueue, ChannelQueue, QueueFactory, QueueFlavor, RingBuffer};
pub use sink::Sink;
pub use stage::{Stage, StageOptions};
pub use stage_queue::StageQueue;
pub use stats::{PercentileTracker, StageState, StageStats, StatsSnapshot};
pub use thread_group::{DefaultThreadGroup, PinnedThreadGroup, ThreadGroup};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
