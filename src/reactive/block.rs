//! Reactive blocks: the actors that own stages.
//!
//! A block is a thread with an unbounded mailbox. All of its stages, their
//! registries and their operator state are confined to that thread, so none of
//! them need locks. Handling one message may enqueue same-block deliveries;
//! those are drained before the next message is taken from the mailbox.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, SendError, Sender};
use tracing::{debug, error, info, trace, warn};

use crate::config::ReactiveConfig;
use crate::error::{ExecutionError, ReactiveError, ReactiveResult, WiringError};
use crate::monitor::MonitorHandle;
use crate::reactive::delegate::{BlockContext, Delivery};
use crate::reactive::identifier::{BlockId, ElementKind, ReactiveIdentifier};
use crate::reactive::stage::{Publisher, Reactive, Stage, StageSnapshot, Subscriber};
use crate::reactive::tracer::Tracer;
use crate::reactive::Packet;

type Ack = Sender<ReactiveResult<()>>;

pub(crate) enum BlockMsg<P> {
    Install(Box<Stage<P>>),
    Connect {
        publisher: ReactiveIdentifier,
        subscriber: ReactiveIdentifier,
        subscriber_block: Sender<BlockMsg<P>>,
        ack: Ack,
    },
    Connected {
        publisher: ReactiveIdentifier,
        subscriber: ReactiveIdentifier,
        publisher_block: Sender<BlockMsg<P>>,
        ack: Ack,
    },
    Pull {
        publisher: ReactiveIdentifier,
        subscriber: ReactiveIdentifier,
    },
    Receive {
        publisher: ReactiveIdentifier,
        subscriber: ReactiveIdentifier,
        packet: P,
    },
    RetryPull {
        publisher: ReactiveIdentifier,
        subscriber: ReactiveIdentifier,
    },
    Demand {
        sink: ReactiveIdentifier,
    },
    Inspect {
        stage: ReactiveIdentifier,
        reply: Sender<ReactiveResult<StageSnapshot>>,
    },
    Stop,
}

/// Address of a running block.
///
/// Cheap to clone; every clone shares the block's scoped id counter.
pub struct BlockHandle<P: Packet> {
    id: BlockId,
    tx: Sender<BlockMsg<P>>,
    next_scoped: Arc<AtomicU64>,
    config: Arc<ReactiveConfig>,
}

impl<P: Packet> Clone for BlockHandle<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
            next_scoped: Arc::clone(&self.next_scoped),
            config: Arc::clone(&self.config),
        }
    }
}

impl<P: Packet> std::fmt::Debug for BlockHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<P: Packet> BlockHandle<P> {
    /// Identity of the block.
    #[must_use]
    pub const fn id(&self) -> BlockId {
        self.id
    }

    pub(crate) fn config(&self) -> &ReactiveConfig {
        &self.config
    }

    pub(crate) fn next_identifier(&self, element: ElementKind) -> ReactiveIdentifier {
        let scoped = self.next_scoped.fetch_add(1, Ordering::Relaxed);
        ReactiveIdentifier::new(self.id, element, scoped)
    }

    pub(crate) fn send(&self, msg: BlockMsg<P>) -> ReactiveResult<()> {
        self.tx.send(msg).map_err(|_| {
            ExecutionError::Disconnected {
                path: self.id.to_string(),
            }
            .into()
        })
    }

    pub(crate) fn install(&self, stage: Stage<P>) -> ReactiveResult<()> {
        self.send(BlockMsg::Install(Box::new(stage)))
    }

    /// Wire `publisher` (owned by this block) to `subscriber` and wait until
    /// both sides have registered each other.
    pub(crate) fn connect(
        &self,
        publisher: ReactiveIdentifier,
        subscriber: ReactiveIdentifier,
        subscriber_block: &Self,
    ) -> ReactiveResult<()> {
        let (ack, done) = bounded(1);
        self.send(BlockMsg::Connect {
            publisher,
            subscriber,
            subscriber_block: subscriber_block.tx.clone(),
            ack,
        })?;
        let timeout = self.config.wiring_timeout();
        await_reply(&done, timeout, "connect")?
    }

    /// Registry state of `stage`, which must live in this block.
    pub fn inspect(&self, stage: ReactiveIdentifier) -> ReactiveResult<StageSnapshot> {
        let (reply, rx) = bounded(1);
        self.send(BlockMsg::Inspect { stage, reply })?;
        await_reply(&rx, self.config.wiring_timeout(), "inspect")?
    }
}

fn await_reply<T>(rx: &Receiver<T>, timeout: Duration, what: &str) -> ReactiveResult<T> {
    rx.recv_timeout(timeout).map_err(|err| match err {
        RecvTimeoutError::Timeout => ExecutionError::Timeout {
            duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
        .into(),
        RecvTimeoutError::Disconnected => ExecutionError::Disconnected { path: what.to_string() }.into(),
    })
}

/// A running block: its handle plus the worker thread.
pub(crate) struct ReactiveBlock<P: Packet> {
    handle: BlockHandle<P>,
    join: Option<JoinHandle<()>>,
}

impl<P: Packet> ReactiveBlock<P> {
    pub(crate) fn spawn(
        network: &str,
        monitor: MonitorHandle,
        tracer: Option<Arc<dyn Tracer<P>>>,
        config: Arc<ReactiveConfig>,
    ) -> ReactiveResult<Self> {
        let id = BlockId::new();
        let (tx, rx) = unbounded();
        let ctx = BlockContext::new(id, tx.clone(), monitor, tracer);
        let join = thread::Builder::new()
            .name(format!("{network}-block-{}", id.short_hash()))
            .spawn(move || {
                let mut worker = BlockWorker {
                    ctx,
                    stages: HashMap::new(),
                };
                worker.run(&rx);
            })
            .map_err(|e| WiringError::SpawnFailed { message: e.to_string() })?;
        debug!(block = %id, "reactive block spawned");
        Ok(Self {
            handle: BlockHandle {
                id,
                tx,
                next_scoped: Arc::new(AtomicU64::new(0)),
                config,
            },
            join: Some(join),
        })
    }

    pub(crate) fn handle(&self) -> BlockHandle<P> {
        self.handle.clone()
    }
}

impl<P: Packet> Drop for ReactiveBlock<P> {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(BlockMsg::Stop);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!(block = %self.handle.id, "reactive block thread panicked");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Done,
    Failed,
    Panicked,
}

struct BlockWorker<P: Packet> {
    ctx: BlockContext<P>,
    stages: HashMap<ReactiveIdentifier, Stage<P>>,
}

impl<P: Packet> BlockWorker<P> {
    fn run(&mut self, rx: &Receiver<BlockMsg<P>>) {
        while let Ok(msg) = rx.recv() {
            if matches!(msg, BlockMsg::Stop) {
                break;
            }
            self.handle(msg);
            while let Some(delivery) = self.ctx.next_delivery() {
                self.deliver(delivery);
            }
        }
        info!(block = %self.ctx.block(), stages = self.stages.len(), "reactive block stopped");
    }

    fn handle(&mut self, msg: BlockMsg<P>) {
        match msg {
            BlockMsg::Install(stage) => {
                stage.on_install(&self.ctx);
                trace!(stage = %stage.identifier(), "stage installed");
                self.stages.insert(stage.identifier(), *stage);
            }
            BlockMsg::Connect {
                publisher,
                subscriber,
                subscriber_block,
                ack,
            } => {
                if let Err(e) = self.connect(publisher, subscriber, subscriber_block.clone()) {
                    let _ = ack.send(Err(e));
                    return;
                }
                let msg = BlockMsg::Connected {
                    publisher,
                    subscriber,
                    publisher_block: self.ctx.mailbox(),
                    ack,
                };
                if let Err(SendError(BlockMsg::Connected { ack, .. })) = subscriber_block.send(msg) {
                    let _ = ack.send(Err(ExecutionError::Disconnected {
                        path: subscriber.owner().to_string(),
                    }
                    .into()));
                }
            }
            BlockMsg::Connected {
                publisher,
                subscriber,
                publisher_block,
                ack,
            } => {
                let result = self.connected(publisher, subscriber, publisher_block);
                let _ = ack.send(result);
            }
            BlockMsg::Pull { publisher, subscriber } => {
                let outcome = self.dispatch(publisher, |stage, ctx| stage.pull(subscriber, ctx));
                if outcome == Dispatch::Panicked {
                    self.abandon_pull(publisher, subscriber);
                }
            }
            BlockMsg::Receive {
                publisher,
                subscriber,
                packet,
            } => self.deliver(Delivery {
                publisher,
                subscriber,
                packet,
            }),
            BlockMsg::RetryPull { publisher, subscriber } => {
                self.dispatch(subscriber, |stage, ctx| stage.retry_pull(publisher, ctx));
            }
            BlockMsg::Demand { sink } => {
                self.dispatch(sink, |stage, ctx| stage.demand(ctx));
            }
            BlockMsg::Inspect { stage, reply } => {
                let snapshot = self
                    .stages
                    .get(&stage)
                    .map(Stage::snapshot)
                    .ok_or_else(|| WiringError::UnknownStage { id: stage }.into());
                let _ = reply.send(snapshot);
            }
            BlockMsg::Stop => {}
        }
    }

    fn connect(
        &mut self,
        publisher: ReactiveIdentifier,
        subscriber: ReactiveIdentifier,
        subscriber_block: Sender<BlockMsg<P>>,
    ) -> ReactiveResult<()> {
        self.ctx.learn_peer(subscriber.owner(), subscriber_block);
        let Self { ctx, stages } = self;
        let stage = stages
            .get_mut(&publisher)
            .ok_or(WiringError::UnknownStage { id: publisher })?;
        stage.register_subscriber(subscriber, ctx)?;
        Ok(())
    }

    fn connected(
        &mut self,
        publisher: ReactiveIdentifier,
        subscriber: ReactiveIdentifier,
        publisher_block: Sender<BlockMsg<P>>,
    ) -> ReactiveResult<()> {
        self.ctx.learn_peer(publisher.owner(), publisher_block);
        let Self { ctx, stages } = self;
        let stage = stages
            .get_mut(&subscriber)
            .ok_or(WiringError::UnknownStage { id: subscriber })?;
        stage.register_publisher(publisher, ctx)?;
        // a subscriber wired after demand arrived must not stall
        stage.resume(ctx)
    }

    fn deliver(&mut self, delivery: Delivery<P>) {
        let Delivery {
            publisher,
            subscriber,
            packet,
        } = delivery;
        let outcome = self.dispatch(subscriber, |stage, ctx| stage.receive(publisher, packet, ctx));
        if outcome == Dispatch::Panicked {
            // the packet died with the handler
            self.ctx.monitor().consume_answer(subscriber);
            if let Err(e) = self.ctx.subscriber(subscriber).re_pull_publisher(publisher) {
                self.fail(subscriber, &e);
            }
        }
    }

    fn abandon_pull(&mut self, publisher: ReactiveIdentifier, subscriber: ReactiveIdentifier) {
        let Self { ctx, stages } = self;
        let Some(stage) = stages.get_mut(&publisher) else {
            return;
        };
        if let Err(e) = stage.abandon_pull(subscriber, ctx) {
            self.fail(publisher, &e);
        }
    }

    fn dispatch<F>(&mut self, id: ReactiveIdentifier, action: F) -> Dispatch
    where
        F: FnOnce(&mut Stage<P>, &mut BlockContext<P>) -> ReactiveResult<()>,
    {
        let Some(stage) = self.stages.get_mut(&id) else {
            let err = WiringError::UnknownStage { id }.into();
            self.fail(id, &err);
            return Dispatch::Failed;
        };
        let ctx = &mut self.ctx;
        match panic::catch_unwind(AssertUnwindSafe(|| action(stage, ctx))) {
            Ok(Ok(())) => Dispatch::Done,
            Ok(Err(e)) => {
                self.fail(id, &e);
                Dispatch::Failed
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(stage = %id, panic = %message, "stage handler panicked");
                Dispatch::Panicked
            }
        }
    }

    fn fail(&self, id: ReactiveIdentifier, err: &ReactiveError) {
        if err.is_execution() {
            warn!(stage = %id, error = %err, "stage could not reach a peer");
            return;
        }
        error!(stage = %id, error = %err, "terminating resolution");
        self.ctx.monitor().terminate(format!("{id}: {err}"));
    }
}
