//! # edge-arbiter: shared-accelerator arbitration for edge video sources
//!
//! Several camera sources on one edge device share a single, serialized
//! inference accelerator. Each source runs its own tick loop and sends a
//! compact record per tick to a coordinator over an unreliable link; the
//! coordinator keeps short per-source scene memory and decides when a full
//! frame is worth asking for.
//!
//! ## Architecture
//!
//! - **Scheduler**: time-division slots over a repeating cycle, optionally
//!   backed by an exclusive lock with stale-holder reclaim
//! - **Pipeline**: priority-ordered stages run once per tick over a borrowed
//!   frame; accelerator stages run inside the source's slot
//! - **Publisher**: sequenced messages, bounded retry backoff and a
//!   tier-aware retry ring for outages
//! - **Coordinator**: gap detection, liveness, scene memory, trigger
//!   decisions and cross-source time correlation
//! - **Communication**: crossbeam channels between threads
//!
//! ## Configuration
//!
//! One TOML file, looked up under the platform config directory
//! (`edge-arbiter/config.toml`) unless a path is given. See [`config`].
//!
//! ## Example
//!
//! ```ignore
//! use edge_arbiter::{
//!     clock::system_clock, config::ArbiterConfig, publisher::ChannelTransport,
//!     scheduler::SlotScheduler, source::SourceBuilder,
//! };
//! use std::sync::Arc;
//!
//! let config = ArbiterConfig::default();
//! let clock = system_clock();
//! let scheduler = Arc::new(SlotScheduler::new(&config.schedule, clock.clone())?);
//! let (transport, link) = ChannelTransport::new(1024);
//!
//! let (runner, commands) = SourceBuilder::new(&config, &config.effective_sources()[0], clock)
//!     .capture(Box::new(my_camera))
//!     .transport(Arc::new(transport))
//!     .scheduler(scheduler)
//!     .default_stages(Some(Box::new(my_model)), frame_requests)?
//!     .build()?;
//! let handle = runner.spawn()?;
//! ```

pub mod capture;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod pipeline;
pub mod publisher;
pub mod scheduler;
pub mod source;
pub mod telemetry;
pub mod types;

// Re-export commonly used types
pub use config::ArbiterConfig;
pub use coordinator::{Coordinator, CoordinatorEvent};
pub use error::{ArbiterError, Result};
pub use pipeline::{PipelineExecutor, PipelineRecord};
pub use publisher::ReliablePublisher;
pub use scheduler::SlotScheduler;
pub use source::{SourceBuilder, SourceCommand, SourceRunner};
pub use types::{GuaranteeTier, SourceId};
