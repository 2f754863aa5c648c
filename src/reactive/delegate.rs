//! Shared bookkeeping every stage needs.
//!
//! A stage handler runs on its block's thread with a mutable [`BlockContext`].
//! The context hands out two views over the same machinery:
//!
//! - [`PublisherDelegate`]: answer accounting, packet delivery, pull tracing.
//! - [`SubscriberDelegate`]: path registration, receive tracing, pulls and
//!   scheduled re-pulls.
//!
//! Packets for a subscriber in the same block are delivered in-process within
//! the current actor step; everything addressed to another block becomes a
//! message. Pulls are always messages, even within a block, so that a reaction
//! to a packet never pulls synchronously on the same call stack.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::trace;

use crate::error::{ExecutionError, ReactiveResult, WiringError};
use crate::monitor::MonitorHandle;
use crate::reactive::block::BlockMsg;
use crate::reactive::identifier::{BlockId, ReactiveIdentifier};
use crate::reactive::tracer::Tracer;
use crate::reactive::Packet;

/// A packet waiting to be handed to a subscriber of this block.
#[derive(Debug)]
pub(crate) struct Delivery<P> {
    pub(crate) publisher: ReactiveIdentifier,
    pub(crate) subscriber: ReactiveIdentifier,
    pub(crate) packet: P,
}

/// Everything a stage may touch outside itself while handling a message.
pub struct BlockContext<P: Packet> {
    block: BlockId,
    mailbox: Sender<BlockMsg<P>>,
    peers: HashMap<BlockId, Sender<BlockMsg<P>>>,
    monitor: MonitorHandle,
    tracer: Option<Arc<dyn Tracer<P>>>,
    local: VecDeque<Delivery<P>>,
}

impl<P: Packet> BlockContext<P> {
    pub(crate) fn new(
        block: BlockId,
        mailbox: Sender<BlockMsg<P>>,
        monitor: MonitorHandle,
        tracer: Option<Arc<dyn Tracer<P>>>,
    ) -> Self {
        let mut peers = HashMap::new();
        peers.insert(block, mailbox.clone());
        Self {
            block,
            mailbox,
            peers,
            monitor,
            tracer,
            local: VecDeque::new(),
        }
    }

    /// The block this context belongs to.
    #[must_use]
    pub const fn block(&self) -> BlockId {
        self.block
    }

    /// The monitor of this network.
    #[must_use]
    pub const fn monitor(&self) -> &MonitorHandle {
        &self.monitor
    }

    /// Publisher-side view for `publisher`.
    pub fn publisher(&mut self, publisher: ReactiveIdentifier) -> PublisherDelegate<'_, P> {
        PublisherDelegate { publisher, ctx: self }
    }

    /// Subscriber-side view for `subscriber`.
    pub fn subscriber(&mut self, subscriber: ReactiveIdentifier) -> SubscriberDelegate<'_, P> {
        SubscriberDelegate { subscriber, ctx: self }
    }

    pub(crate) fn mailbox(&self) -> Sender<BlockMsg<P>> {
        self.mailbox.clone()
    }

    pub(crate) fn learn_peer(&mut self, block: BlockId, mailbox: Sender<BlockMsg<P>>) {
        self.peers.entry(block).or_insert(mailbox);
    }

    pub(crate) fn next_delivery(&mut self) -> Option<Delivery<P>> {
        self.local.pop_front()
    }

    fn send(&self, block: BlockId, msg: BlockMsg<P>) -> ReactiveResult<()> {
        let peer = self.peers.get(&block).ok_or(WiringError::UnknownBlock { block })?;
        peer.send(msg).map_err(|_| {
            ExecutionError::Disconnected {
                path: block.to_string(),
            }
            .into()
        })
    }
}

/// Publisher-side bookkeeping for one stage.
pub struct PublisherDelegate<'a, P: Packet> {
    publisher: ReactiveIdentifier,
    ctx: &'a mut BlockContext<P>,
}

impl<P: Packet> PublisherDelegate<'_, P> {
    /// Report `n` answers produced by this publisher.
    ///
    /// Must be sent before the packets themselves leave the stage.
    pub fn monitor_create_answers(&self, n: usize) {
        for _ in 0..n {
            self.ctx.monitor.create_answer(self.publisher);
        }
    }

    /// Report `n` answers produced by this publisher for `subscriber` only.
    pub fn monitor_create_answers_for(&self, subscriber: ReactiveIdentifier, n: usize) {
        for _ in 0..n {
            self.ctx.monitor.create_answer_for(self.publisher, subscriber);
        }
    }

    /// Report `n` answers absorbed by this publisher.
    pub fn monitor_consume_answers(&self, n: usize) {
        for _ in 0..n {
            self.ctx.monitor.consume_answer(self.publisher);
        }
    }

    /// Hand `packet` to `subscriber`.
    pub fn subscriber_receive(&mut self, subscriber: ReactiveIdentifier, packet: P) -> ReactiveResult<()> {
        if subscriber.owner() == self.ctx.block {
            self.ctx.local.push_back(Delivery {
                publisher: self.publisher,
                subscriber,
                packet,
            });
            return Ok(());
        }
        self.ctx.send(
            subscriber.owner(),
            BlockMsg::Receive {
                publisher: self.publisher,
                subscriber,
                packet,
            },
        )
    }

    /// Record that `subscriber` pulled this publisher.
    pub fn trace_pull(&self, subscriber: &ReactiveIdentifier) {
        trace!(publisher = %self.publisher, subscriber = %subscriber, "pull");
        if let Some(tracer) = &self.ctx.tracer {
            tracer.pull(subscriber, &self.publisher);
        }
    }
}

/// Subscriber-side bookkeeping for one stage.
pub struct SubscriberDelegate<'a, P: Packet> {
    subscriber: ReactiveIdentifier,
    ctx: &'a mut BlockContext<P>,
}

impl<P: Packet> SubscriberDelegate<'_, P> {
    /// Tell the monitor this subscriber now pulls from `publisher`.
    pub fn register_path(&self, publisher: ReactiveIdentifier) {
        self.ctx.monitor.register_path(self.subscriber, publisher);
    }

    /// Record that this subscriber received `packet` from `publisher`.
    pub fn trace_receive(&self, publisher: &ReactiveIdentifier, packet: &P) {
        trace!(publisher = %publisher, subscriber = %self.subscriber, ?packet, "receive");
        if let Some(tracer) = &self.ctx.tracer {
            tracer.receive(publisher, &self.subscriber, packet);
        }
    }

    /// Send a pull to `publisher`. Always queued, never invoked inline.
    pub fn pull(&self, publisher: ReactiveIdentifier) -> ReactiveResult<()> {
        self.ctx.send(
            publisher.owner(),
            BlockMsg::Pull {
                publisher,
                subscriber: self.subscriber,
            },
        )
    }

    /// Schedule another pull of `publisher` through this block's own mailbox.
    pub fn re_pull_publisher(&self, publisher: ReactiveIdentifier) -> ReactiveResult<()> {
        self.ctx
            .mailbox
            .send(BlockMsg::RetryPull {
                publisher,
                subscriber: self.subscriber,
            })
            .map_err(|_| {
                ExecutionError::Disconnected {
                    path: self.ctx.block.to_string(),
                }
                .into()
            })
    }
}
