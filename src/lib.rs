//! # KyroQL Reasoner - Reactive Resolution Engine
//!
//! The reasoner answers rule-based queries by wiring a network of streaming
//! stages and pulling answers through it. Recursive rules become cycles in the
//! network; a monitor keeps a global answer ledger and tells each query when
//! nothing more can arrive.
//!
//! ## Core Concepts
//!
//! - **Stage**: a publisher, a subscriber, or both (Source, Map, FlatMap,
//!   Distinct, Buffer, Merge, Sink)
//! - **Reactive block**: an actor thread owning a group of stages
//! - **Registry**: per-stage peers and their pulling flags
//! - **Monitor**: global created/consumed accounting and termination detection
//! - **Resolution tree**: diagnostic record of visited states
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kyroql_reasoner::{ReactiveConfig, ReactiveNetwork};
//!
//! let mut network = ReactiveNetwork::<u32>::new(ReactiveConfig::default())?;
//! let block = network.spawn_block()?;
//! let doubled = block.source(|| vec![1, 2, 3])?.map(|x| x * 2)?;
//! let mut answers = block.sink(&doubled)?;
//! assert_eq!(answers.collect_remaining()?, vec![2, 4, 6]);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod monitor;
pub mod network;
pub mod reactive;
pub mod tree;

// Re-export primary types at crate root for convenience
pub use config::ReactiveConfig;
pub use error::{ExecutionError, ReactiveError, ReactiveResult, RegistryError, WiringError};
pub use monitor::{AnswerCount, LedgerSnapshot, Monitor, MonitorHandle, RootSignal};
pub use network::{BlockHandle, ReactiveNetwork, StageHandle};
pub use reactive::{
    AnswerStream, BlockId, Cardinality, ElementKind, FileTracer, Packet, PublisherRegistry, ReactiveIdentifier,
    RecordingTracer, Registry, Role, SinkEvent, StageSnapshot, SubscriberRegistry, TraceEvent, Tracer,
};
pub use tree::{MultiNode, Node, ResolutionState, ResolutionTree};
