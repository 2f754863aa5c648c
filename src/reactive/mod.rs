//! The reactive dataflow engine.
//!
//! Stages are wired into a directed graph (cycles allowed) and live inside
//! reactive blocks, one thread each. Data moves by pull: a subscriber asks a
//! publisher for one packet, and the publisher answers when it has one.
//!
//! # Architecture
//!
//! ```text
//!  caller ──Demand──► Sink ──pull──► Buffer ──pull──► Distinct ──pull──► Merge ──► Source
//!                       ▲              │                                   ▲
//!                       └── packets ───┤                                   │
//!                                      └──────────► FlatMap ───────────────┘
//! ```
//!
//! Every create/consume of an answer is reported to the monitor, which tells
//! the sink when nothing more can arrive.

pub mod block;
pub mod delegate;
pub mod identifier;
pub mod registry;
pub mod sink;
pub mod stage;
pub mod tracer;

use std::fmt::Debug;
use std::hash::Hash;

pub use block::BlockHandle;
pub use delegate::{BlockContext, PublisherDelegate, SubscriberDelegate};
pub use identifier::{BlockId, ElementKind, ReactiveIdentifier, Role};
pub use registry::{Cardinality, PublisherRegistry, Registry, SubscriberRegistry};
pub use sink::{AnswerStream, SinkEvent};
pub use stage::{Publisher, Reactive, StageSnapshot, Subscriber};
pub use tracer::{FileTracer, RecordingTracer, TraceEvent, Tracer};

/// Data flowing through a network.
///
/// `Eq + Hash` lets `Distinct` remember what it has seen; `Debug` feeds traces.
pub trait Packet: Clone + Eq + Hash + Debug + Send + 'static {}

impl<T> Packet for T where T: Clone + Eq + Hash + Debug + Send + 'static {}
