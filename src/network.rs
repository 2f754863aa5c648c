//! Building and owning a reactive network.
//!
//! A [`ReactiveNetwork`] owns the monitor and every block thread. Stages are
//! created through [`BlockHandle`] and [`StageHandle`]; each wiring call waits
//! for both ends to acknowledge, so once it returns the path is registered
//! with the monitor and demand can flow across it.
//!
//! Dropping the network stops every block and then the monitor, joining all
//! threads.

use std::collections::HashSet;
use std::sync::Arc;

use crossbeam_channel::unbounded;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ReactiveConfig;
use crate::error::{ReactiveError, ReactiveResult, WiringError};
use crate::monitor::{LedgerSnapshot, Monitor, MonitorHandle};
use crate::reactive::block::ReactiveBlock;
use crate::reactive::identifier::{BlockId, ElementKind, ReactiveIdentifier, Role};
use crate::reactive::sink::AnswerStream;
use crate::reactive::stage::{BufferState, FlatMapFn, MapFn, Operator, PacketIter, SourceFn, Stage, StageSnapshot};
use crate::reactive::tracer::{FileTracer, Tracer};
use crate::reactive::Packet;

pub use crate::reactive::block::BlockHandle;

/// A running dataflow network.
pub struct ReactiveNetwork<P: Packet> {
    blocks: Vec<ReactiveBlock<P>>,
    monitor: Monitor,
    name: String,
    config: Arc<ReactiveConfig>,
    tracer: Option<Arc<dyn Tracer<P>>>,
}

impl<P: Packet> ReactiveNetwork<P> {
    /// Start the monitor. A file tracer is attached when the configuration
    /// enables `trace_inference`.
    pub fn new(config: ReactiveConfig) -> ReactiveResult<Self> {
        config.validate()?;
        let name = format!("reasoner-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let tracer: Option<Arc<dyn Tracer<P>>> = match (config.trace_inference, &config.trace_dir) {
            (true, Some(dir)) => {
                let tracer = FileTracer::create(dir, &name)?;
                info!(network = %name, path = %tracer.path().display(), "tracing inference");
                Some(Arc::new(tracer))
            }
            _ => None,
        };
        Self::build(name, config, tracer)
    }

    /// Start the monitor and report every pull and packet to `tracer`.
    pub fn with_tracer(config: ReactiveConfig, tracer: Arc<dyn Tracer<P>>) -> ReactiveResult<Self> {
        config.validate()?;
        let name = format!("reasoner-{}", &Uuid::new_v4().simple().to_string()[..8]);
        Self::build(name, config, Some(tracer))
    }

    fn build(name: String, config: ReactiveConfig, tracer: Option<Arc<dyn Tracer<P>>>) -> ReactiveResult<Self> {
        let monitor = Monitor::spawn(&name)?;
        debug!(network = %name, "reactive network started");
        Ok(Self {
            blocks: Vec::new(),
            monitor,
            name,
            config: Arc::new(config),
            tracer,
        })
    }

    /// Name used for threads and trace files.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &ReactiveConfig {
        &self.config
    }

    /// Start a new reactive block.
    pub fn spawn_block(&mut self) -> ReactiveResult<BlockHandle<P>> {
        let block = ReactiveBlock::spawn(
            &self.name,
            self.monitor.handle(),
            self.tracer.clone(),
            Arc::clone(&self.config),
        )?;
        let handle = block.handle();
        self.blocks.push(block);
        Ok(handle)
    }

    /// Identities of every running block.
    #[must_use]
    pub fn blocks(&self) -> HashSet<BlockId> {
        self.blocks.iter().map(|b| b.handle().id()).collect()
    }

    /// Address of the monitor.
    #[must_use]
    pub fn monitor(&self) -> MonitorHandle {
        self.monitor.handle()
    }

    /// Copy of the answer ledger, ordered after every event already reported.
    pub fn ledger(&self) -> ReactiveResult<LedgerSnapshot> {
        self.monitor.handle().snapshot(self.config.wiring_timeout())
    }
}

impl<P: Packet> Drop for ReactiveNetwork<P> {
    fn drop(&mut self) {
        let blocks = self.blocks.len();
        self.blocks.clear();
        info!(network = %self.name, blocks, "reactive network stopped");
    }
}

impl<P: Packet> BlockHandle<P> {
    /// Install a source that draws packets from the iterator built by
    /// `supplier` on its first pull.
    pub fn source<F, I>(&self, supplier: F) -> ReactiveResult<StageHandle<P>>
    where
        F: FnOnce() -> I + Send + 'static,
        I: IntoIterator<Item = P>,
        I::IntoIter: Send + 'static,
    {
        let id = self.next_identifier(ElementKind::Source);
        let supplier: SourceFn<P> = Box::new(move || -> PacketIter<P> { Box::new(supplier().into_iter()) });
        self.install(Stage::source(id, supplier))?;
        Ok(StageHandle::new(id, self.clone()))
    }

    /// Install an unconnected fan-in stage.
    pub fn merge(&self) -> ReactiveResult<StageHandle<P>> {
        self.operator(Operator::Merge)
    }

    /// Install a sink in this block fed by `upstream`.
    pub fn sink(&self, upstream: &StageHandle<P>) -> ReactiveResult<AnswerStream<P>> {
        let id = self.next_identifier(ElementKind::Sink);
        let (tx, rx) = unbounded();
        self.install(Stage::sink(id, tx))?;
        let sink = StageHandle::new(id, self.clone());
        upstream.subscribe(&sink)?;
        Ok(AnswerStream::new(id, self.clone(), rx))
    }

    fn operator(&self, operator: Operator<P>) -> ReactiveResult<StageHandle<P>> {
        let id = self.next_identifier(operator.kind());
        self.install(Stage::operator(id, operator))?;
        Ok(StageHandle::new(id, self.clone()))
    }
}

/// Address of an installed stage plus the block that owns it.
pub struct StageHandle<P: Packet> {
    id: ReactiveIdentifier,
    block: BlockHandle<P>,
}

impl<P: Packet> Clone for StageHandle<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            block: self.block.clone(),
        }
    }
}

impl<P: Packet> std::fmt::Debug for StageHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageHandle").field("id", &self.id).finish()
    }
}

impl<P: Packet> StageHandle<P> {
    const fn new(id: ReactiveIdentifier, block: BlockHandle<P>) -> Self {
        Self { id, block }
    }

    /// Address of the stage.
    #[must_use]
    pub const fn identifier(&self) -> ReactiveIdentifier {
        self.id
    }

    /// Block that owns the stage.
    #[must_use]
    pub const fn block(&self) -> &BlockHandle<P> {
        &self.block
    }

    /// Register `subscriber` as a consumer of this stage.
    ///
    /// Stages with a single-subscriber registry reject a second distinct
    /// subscriber with a registry error.
    pub fn subscribe(&self, subscriber: &Self) -> ReactiveResult<()> {
        if !self.id.element().publishes() {
            return Err(wrong_role(self.id, Role::Publisher));
        }
        if !subscriber.id.element().subscribes() {
            return Err(wrong_role(subscriber.id, Role::Subscriber));
        }
        self.block.connect(self.id, subscriber.id, &subscriber.block)?;
        debug!(publisher = %self.id, subscriber = %subscriber.id, "connected");
        Ok(())
    }

    /// Apply `f` to every packet.
    pub fn map<F>(&self, f: F) -> ReactiveResult<Self>
    where
        F: Fn(P) -> P + Send + 'static,
    {
        let f: MapFn<P> = Box::new(f);
        self.then(Operator::Map(f))
    }

    /// Replace every packet with zero or more packets.
    pub fn flat_map<F, I>(&self, f: F) -> ReactiveResult<Self>
    where
        F: Fn(P) -> I + Send + 'static,
        I: IntoIterator<Item = P>,
    {
        let f: FlatMapFn<P> = Box::new(move |packet| f(packet).into_iter().collect());
        self.then(Operator::FlatMap(f))
    }

    /// Drop packets already seen by this stage.
    pub fn distinct(&self) -> ReactiveResult<Self> {
        self.then(Operator::Distinct(HashSet::new()))
    }

    /// Keep every packet and replay the full history to late subscribers.
    pub fn buffer(&self) -> ReactiveResult<Self> {
        self.then(Operator::Buffer(BufferState::default()))
    }

    /// Registry state of the stage.
    pub fn inspect(&self) -> ReactiveResult<StageSnapshot> {
        self.block.inspect(self.id)
    }

    fn then(&self, operator: Operator<P>) -> ReactiveResult<Self> {
        let next = self.block.operator(operator)?;
        self.subscribe(&next)?;
        Ok(next)
    }
}

fn wrong_role(id: ReactiveIdentifier, role: Role) -> ReactiveError {
    WiringError::WrongRole { id, role }.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_are_tracked() {
        let mut network = ReactiveNetwork::<u32>::new(ReactiveConfig::default()).unwrap();
        let a = network.spawn_block().unwrap();
        let b = network.spawn_block().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(network.blocks().len(), 2);
    }

    #[test]
    fn test_sink_cannot_publish() {
        let mut network = ReactiveNetwork::<u32>::new(ReactiveConfig::default()).unwrap();
        let block = network.spawn_block().unwrap();
        let source = block.source(|| vec![1]).unwrap();
        let stream = block.sink(&source).unwrap();
        let sink = StageHandle::new(stream.identifier(), block.clone());

        let merge = block.merge().unwrap();
        let err = sink.subscribe(&merge).unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn test_trace_file_named_after_network() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReactiveConfig::default().with_trace_dir(dir.path());
        let network = ReactiveNetwork::<u32>::new(config).unwrap();
        let expected = dir.path().join(format!("{}.dot", network.name()));
        assert!(expected.exists());
    }
}
