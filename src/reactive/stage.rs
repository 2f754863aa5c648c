//! Stages of the dataflow network.
//!
//! Every stage is a [`Stage`]: an identifier, the two registries and a
//! [`StageKind`] holding the per-kind state. Sources only publish, sinks only
//! subscribe, and the streaming operators do both. Dispatch over operators is a
//! `match`; there is no per-operator trait object.
//!
//! Answer accounting per received packet:
//!
//! | stage    | create                         | consume                  |
//! |----------|--------------------------------|--------------------------|
//! | Source   | 1 per emitted packet           |                          |
//! | Map      |                                |                          |
//! | FlatMap  | k outputs                      | 1 input                  |
//! | Distinct |                                | 1 per suppressed packet  |
//! | Buffer   | 1 per subscriber, on its edge  | 1 per received packet    |
//! | Merge    |                                |                          |
//! | Sink     |                                | 1 per answer             |

use std::collections::{HashMap, HashSet, VecDeque};

use crossbeam_channel::Sender;
use tracing::{debug, trace, warn};

use crate::error::{ReactiveError, ReactiveResult, RegistryError, WiringError};
use crate::monitor::RootSignal;
use crate::reactive::delegate::BlockContext;
use crate::reactive::identifier::{BlockId, ElementKind, ReactiveIdentifier, Role};
use crate::reactive::registry::{Cardinality, PublisherRegistry, Registry, SubscriberRegistry};
use crate::reactive::sink::SinkEvent;
use crate::reactive::Packet;

pub(crate) type MapFn<P> = Box<dyn Fn(P) -> P + Send>;
pub(crate) type FlatMapFn<P> = Box<dyn Fn(P) -> Vec<P> + Send>;
pub(crate) type PacketIter<P> = Box<dyn Iterator<Item = P> + Send>;
pub(crate) type SourceFn<P> = Box<dyn FnOnce() -> PacketIter<P> + Send>;

/// Anything addressable inside the network.
pub trait Reactive {
    /// Address of this stage.
    fn identifier(&self) -> ReactiveIdentifier;

    /// Block that owns this stage.
    fn reactive_block(&self) -> BlockId {
        self.identifier().owner()
    }
}

/// A stage that accepts pulls and emits packets.
pub trait Publisher<P: Packet>: Reactive {
    /// Record `subscriber` as a consumer of this stage.
    fn register_subscriber(
        &mut self,
        subscriber: ReactiveIdentifier,
        ctx: &mut BlockContext<P>,
    ) -> ReactiveResult<bool>;

    /// `subscriber` asks for one more packet.
    fn pull(&mut self, subscriber: ReactiveIdentifier, ctx: &mut BlockContext<P>) -> ReactiveResult<()>;
}

/// A stage that pulls and receives packets.
pub trait Subscriber<P: Packet>: Reactive {
    /// Record `publisher` as an input of this stage.
    fn register_publisher(
        &mut self,
        publisher: ReactiveIdentifier,
        ctx: &mut BlockContext<P>,
    ) -> ReactiveResult<bool>;

    /// `publisher` delivers `packet` to this stage.
    fn receive(
        &mut self,
        publisher: ReactiveIdentifier,
        packet: P,
        ctx: &mut BlockContext<P>,
    ) -> ReactiveResult<()>;
}

/// Streaming operators.
pub(crate) enum Operator<P> {
    Map(MapFn<P>),
    FlatMap(FlatMapFn<P>),
    Distinct(HashSet<P>),
    Buffer(BufferState<P>),
    Merge,
}

impl<P> Operator<P> {
    pub(crate) const fn kind(&self) -> ElementKind {
        match self {
            Self::Map(_) => ElementKind::Map,
            Self::FlatMap(_) => ElementKind::FlatMap,
            Self::Distinct(_) => ElementKind::Distinct,
            Self::Buffer(_) => ElementKind::Buffer,
            Self::Merge => ElementKind::Merge,
        }
    }

    const fn cardinalities(&self) -> (Cardinality, Cardinality) {
        match self {
            Self::Merge => (Cardinality::Multi, Cardinality::Single),
            Self::Buffer(_) => (Cardinality::Single, Cardinality::Multi),
            _ => (Cardinality::Single, Cardinality::Single),
        }
    }
}

/// Full history plus a replay queue per subscriber.
pub(crate) struct BufferState<P> {
    history: Vec<P>,
    queues: HashMap<ReactiveIdentifier, VecDeque<P>>,
}

impl<P> Default for BufferState<P> {
    fn default() -> Self {
        Self {
            history: Vec::new(),
            queues: HashMap::new(),
        }
    }
}

pub(crate) struct SourceState<P> {
    supplier: Option<SourceFn<P>>,
    iter: Option<PacketIter<P>>,
    finished: bool,
}

impl<P> SourceState<P> {
    fn next(&mut self) -> Option<P> {
        if self.iter.is_none() {
            let supplier = self.supplier.take()?;
            self.iter = Some(supplier());
        }
        self.iter.as_mut().and_then(Iterator::next)
    }
}

pub(crate) struct SinkState<P> {
    output: Sender<SinkEvent<P>>,
    demand: bool,
}

pub(crate) enum StageKind<P> {
    Source(SourceState<P>),
    Operator(Operator<P>),
    Sink(SinkState<P>),
}

/// Registry state of one stage, as seen from inside its block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSnapshot {
    /// The stage.
    pub id: ReactiveIdentifier,
    /// Registered publishers.
    pub publishers: HashSet<ReactiveIdentifier>,
    /// Publishers with a pull outstanding.
    pub pulling_publishers: HashSet<ReactiveIdentifier>,
    /// Registered subscribers.
    pub subscribers: HashSet<ReactiveIdentifier>,
    /// Subscribers waiting for a packet.
    pub pulling_subscribers: HashSet<ReactiveIdentifier>,
}

pub(crate) struct Stage<P> {
    id: ReactiveIdentifier,
    publishers: PublisherRegistry,
    subscribers: SubscriberRegistry,
    kind: StageKind<P>,
}

impl<P: Packet> Stage<P> {
    pub(crate) fn source(id: ReactiveIdentifier, supplier: SourceFn<P>) -> Self {
        Self {
            id,
            publishers: PublisherRegistry::single(),
            subscribers: SubscriberRegistry::single(),
            kind: StageKind::Source(SourceState {
                supplier: Some(supplier),
                iter: None,
                finished: false,
            }),
        }
    }

    pub(crate) fn operator(id: ReactiveIdentifier, operator: Operator<P>) -> Self {
        let (upstream, downstream) = operator.cardinalities();
        Self {
            id,
            publishers: PublisherRegistry::with_cardinality(upstream),
            subscribers: SubscriberRegistry::with_cardinality(downstream),
            kind: StageKind::Operator(operator),
        }
    }

    pub(crate) fn sink(id: ReactiveIdentifier, output: Sender<SinkEvent<P>>) -> Self {
        Self {
            id,
            publishers: PublisherRegistry::single(),
            subscribers: SubscriberRegistry::single(),
            kind: StageKind::Sink(SinkState { output, demand: false }),
        }
    }

    /// Announce the stage to the monitor.
    pub(crate) fn on_install(&self, ctx: &BlockContext<P>) {
        match &self.kind {
            StageKind::Source(_) => ctx.monitor().register_source(self.id),
            StageKind::Sink(sink) => {
                let output = sink.output.clone();
                ctx.monitor().register_root(
                    self.id,
                    Box::new(move |signal| {
                        let event = match signal {
                            RootSignal::Finished => SinkEvent::Done,
                            RootSignal::Failed(cause) => SinkEvent::Failed(cause),
                        };
                        let _ = output.send(event);
                    }),
                );
            }
            StageKind::Operator(_) => {}
        }
    }

    fn has_demand(&self) -> bool {
        match &self.kind {
            StageKind::Sink(sink) => sink.demand,
            _ => self.subscribers.any_pulling(),
        }
    }

    /// Pull every input that is not already pulled, if anyone downstream waits.
    pub(crate) fn resume(&mut self, ctx: &mut BlockContext<P>) -> ReactiveResult<()> {
        if self.has_demand() {
            pull_upstream(self.id, &mut self.publishers, ctx)?;
        }
        Ok(())
    }

    /// The caller of a sink wants one more answer.
    pub(crate) fn demand(&mut self, ctx: &mut BlockContext<P>) -> ReactiveResult<()> {
        match &mut self.kind {
            StageKind::Sink(sink) => sink.demand = true,
            _ => {
                return Err(WiringError::WrongRole {
                    id: self.id,
                    role: Role::Subscriber,
                }
                .into())
            }
        }
        pull_upstream(self.id, &mut self.publishers, ctx)
    }

    /// Scheduled re-pull of `publisher`.
    ///
    /// Dropped when nobody downstream still waits; the next pull from
    /// downstream restarts the flow.
    pub(crate) fn retry_pull(
        &mut self,
        publisher: ReactiveIdentifier,
        ctx: &mut BlockContext<P>,
    ) -> ReactiveResult<()> {
        if !self.has_demand() {
            trace!(stage = %self.id, publisher = %publisher, "retry dropped, no demand");
            return Ok(());
        }
        if self.publishers.set_pulling(&publisher)? {
            ctx.subscriber(self.id).pull(publisher)?;
        }
        Ok(())
    }

    /// Schedule a re-pull of `publisher` if this stage still owes a packet.
    pub(crate) fn retry_if_demand(
        &self,
        publisher: ReactiveIdentifier,
        ctx: &mut BlockContext<P>,
    ) -> ReactiveResult<()> {
        if !self.publishers.contains(&publisher) {
            return Err(RegistryError::UnknownPeer { peer: publisher }.into());
        }
        if self.has_demand() {
            ctx.subscriber(self.id).re_pull_publisher(publisher)?;
        }
        Ok(())
    }

    /// Give up on a pull whose handler panicked.
    ///
    /// A source is closed, since its iterator is left in an unknown state. No
    /// other stage can still answer the pull, so the resolution is aborted.
    pub(crate) fn abandon_pull(
        &mut self,
        subscriber: ReactiveIdentifier,
        ctx: &mut BlockContext<P>,
    ) -> ReactiveResult<()> {
        self.subscribers.set_not_pulling_for(&subscriber)?;
        let StageKind::Source(source) = &mut self.kind else {
            return Err(ReactiveError::internal(format!("pull of {} panicked", self.id)));
        };
        source.supplier = None;
        source.iter = None;
        if !source.finished {
            source.finished = true;
            warn!(source = %self.id, "source closed after a panic");
            ctx.monitor().source_finished(self.id);
        }
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> StageSnapshot {
        StageSnapshot {
            id: self.id,
            publishers: self.publishers.publishers(),
            pulling_publishers: self
                .publishers
                .publishers()
                .into_iter()
                .filter(|p| self.publishers.is_pulling(p))
                .collect(),
            subscribers: self.subscribers.subscribers(),
            pulling_subscribers: self.subscribers.pulling(),
        }
    }

    fn wrong_role(&self, role: Role) -> ReactiveError {
        WiringError::WrongRole { id: self.id, role }.into()
    }
}

fn pull_upstream<P: Packet>(
    id: ReactiveIdentifier,
    publishers: &mut PublisherRegistry,
    ctx: &mut BlockContext<P>,
) -> ReactiveResult<()> {
    for publisher in publishers.non_pulling() {
        ctx.subscriber(id).pull(publisher)?;
    }
    Ok(())
}

/// Send `outputs` to the single subscriber of a non-buffering operator.
fn forward<P: Packet>(
    id: ReactiveIdentifier,
    subscribers: &mut SubscriberRegistry,
    outputs: Vec<P>,
    ctx: &mut BlockContext<P>,
) -> ReactiveResult<()> {
    let Some(subscriber) = subscribers.subscribers().into_iter().next() else {
        debug!(stage = %id, dropped = outputs.len(), "no subscriber, absorbing packets");
        ctx.publisher(id).monitor_consume_answers(outputs.len());
        return Ok(());
    };
    subscribers.set_not_pulling_for(&subscriber)?;
    let mut delegate = ctx.publisher(id);
    for packet in outputs {
        delegate.subscriber_receive(subscriber, packet)?;
    }
    Ok(())
}

fn buffer_receive<P: Packet>(
    id: ReactiveIdentifier,
    subscribers: &mut SubscriberRegistry,
    buffer: &mut BufferState<P>,
    packet: P,
    ctx: &mut BlockContext<P>,
) -> ReactiveResult<()> {
    let targets = subscribers.subscribers();
    // each queued copy belongs to its subscriber's branch alone
    for subscriber in &targets {
        ctx.publisher(id).monitor_create_answers_for(*subscriber, 1);
    }
    ctx.publisher(id).monitor_consume_answers(1);
    for subscriber in &targets {
        buffer.queues.entry(*subscriber).or_default().push_back(packet.clone());
    }
    buffer.history.push(packet);

    for subscriber in subscribers.pulling() {
        if let Some(next) = buffer.queues.get_mut(&subscriber).and_then(VecDeque::pop_front) {
            subscribers.set_not_pulling_for(&subscriber)?;
            ctx.publisher(id).subscriber_receive(subscriber, next)?;
        }
    }
    Ok(())
}

impl<P: Packet> Reactive for Stage<P> {
    fn identifier(&self) -> ReactiveIdentifier {
        self.id
    }
}

impl<P: Packet> Publisher<P> for Stage<P> {
    fn register_subscriber(
        &mut self,
        subscriber: ReactiveIdentifier,
        ctx: &mut BlockContext<P>,
    ) -> ReactiveResult<bool> {
        if !self.id.element().publishes() {
            return Err(self.wrong_role(Role::Publisher));
        }
        let added = self.subscribers.add_subscriber(subscriber)?;
        if added {
            if let StageKind::Operator(Operator::Buffer(buffer)) = &mut self.kind {
                // late subscribers see everything seen so far
                ctx.publisher(self.id).monitor_create_answers_for(subscriber, buffer.history.len());
                buffer
                    .queues
                    .insert(subscriber, buffer.history.iter().cloned().collect());
            }
            debug!(publisher = %self.id, subscriber = %subscriber, "subscriber registered");
        }
        Ok(added)
    }

    fn pull(&mut self, subscriber: ReactiveIdentifier, ctx: &mut BlockContext<P>) -> ReactiveResult<()> {
        if !self.id.element().publishes() {
            return Err(self.wrong_role(Role::Publisher));
        }
        ctx.publisher(self.id).trace_pull(&subscriber);
        if !self.subscribers.record_pull(&subscriber)? {
            return Ok(());
        }

        let Self {
            id,
            publishers,
            subscribers,
            kind,
        } = self;
        match kind {
            StageKind::Source(source) => match source.next() {
                Some(packet) => {
                    ctx.publisher(*id).monitor_create_answers(1);
                    subscribers.set_not_pulling_for(&subscriber)?;
                    ctx.publisher(*id).subscriber_receive(subscriber, packet)?;
                }
                None => {
                    if !source.finished {
                        source.finished = true;
                        debug!(source = %id, "source exhausted");
                        ctx.monitor().source_finished(*id);
                    }
                }
            },
            StageKind::Operator(Operator::Buffer(buffer)) => {
                match buffer.queues.get_mut(&subscriber).and_then(VecDeque::pop_front) {
                    Some(packet) => {
                        subscribers.set_not_pulling_for(&subscriber)?;
                        ctx.publisher(*id).subscriber_receive(subscriber, packet)?;
                    }
                    None => pull_upstream(*id, publishers, ctx)?,
                }
            }
            StageKind::Operator(_) => pull_upstream(*id, publishers, ctx)?,
            StageKind::Sink(_) => {
                return Err(WiringError::WrongRole {
                    id: *id,
                    role: Role::Publisher,
                }
                .into())
            }
        }
        Ok(())
    }
}

impl<P: Packet> Subscriber<P> for Stage<P> {
    fn register_publisher(
        &mut self,
        publisher: ReactiveIdentifier,
        ctx: &mut BlockContext<P>,
    ) -> ReactiveResult<bool> {
        if !self.id.element().subscribes() {
            return Err(self.wrong_role(Role::Subscriber));
        }
        let added = self.publishers.add(publisher)?;
        if added {
            ctx.subscriber(self.id).register_path(publisher);
        }
        Ok(added)
    }

    fn receive(
        &mut self,
        publisher: ReactiveIdentifier,
        packet: P,
        ctx: &mut BlockContext<P>,
    ) -> ReactiveResult<()> {
        if !self.id.element().subscribes() {
            return Err(self.wrong_role(Role::Subscriber));
        }
        self.publishers.record_receive(&publisher)?;
        ctx.subscriber(self.id).trace_receive(&publisher, &packet);

        let Self {
            id,
            subscribers,
            kind,
            ..
        } = self;
        let outputs = match kind {
            StageKind::Sink(sink) => {
                sink.demand = false;
                if sink.output.send(SinkEvent::Answer(packet)).is_err() {
                    debug!(sink = %id, "answer stream dropped");
                }
                ctx.monitor().consume_answer(*id);
                return Ok(());
            }
            StageKind::Operator(Operator::Map(f)) => vec![f(packet)],
            StageKind::Operator(Operator::FlatMap(f)) => {
                let outputs = f(packet);
                let delegate = ctx.publisher(*id);
                delegate.monitor_create_answers(outputs.len());
                delegate.monitor_consume_answers(1);
                outputs
            }
            StageKind::Operator(Operator::Distinct(seen)) => {
                if seen.insert(packet.clone()) {
                    vec![packet]
                } else {
                    ctx.publisher(*id).monitor_consume_answers(1);
                    Vec::new()
                }
            }
            StageKind::Operator(Operator::Merge) => vec![packet],
            StageKind::Operator(Operator::Buffer(buffer)) => {
                return buffer_receive(*id, subscribers, buffer, packet, ctx);
            }
            StageKind::Source(_) => {
                return Err(WiringError::WrongRole {
                    id: *id,
                    role: Role::Subscriber,
                }
                .into())
            }
        };

        if outputs.is_empty() {
            return self.retry_if_demand(publisher, ctx);
        }
        forward(*id, subscribers, outputs, ctx)
    }
}
