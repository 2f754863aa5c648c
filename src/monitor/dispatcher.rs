//! Monitor worker.
//!
//! The monitor owns the global answer ledger on a dedicated thread. Stages only
//! ever send it messages through a [`MonitorHandle`]; nothing reads or mutates
//! the ledger directly. After every event that can settle a root, the worker
//! re-evaluates the registered roots and signals the ones that are finished.

use std::collections::HashMap;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::error::{ExecutionError, ReactiveError, ReactiveResult, WiringError};
use crate::reactive::identifier::ReactiveIdentifier;

use super::ledger::{AnswerLedger, LedgerSnapshot};

/// Completion signal delivered to a registered root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootSignal {
    /// No further answers will ever reach the root.
    Finished,
    /// The resolution was aborted.
    Failed(String),
}

/// Callback a root registers to learn about its completion.
pub type RootCallback = Box<dyn Fn(RootSignal) + Send>;

pub(crate) enum MonitorMsg {
    CreateAnswer(ReactiveIdentifier),
    CreateAnswerFor {
        publisher: ReactiveIdentifier,
        subscriber: ReactiveIdentifier,
    },
    ConsumeAnswer(ReactiveIdentifier),
    RegisterPath {
        subscriber: ReactiveIdentifier,
        publisher: ReactiveIdentifier,
    },
    RegisterSource(ReactiveIdentifier),
    SourceFinished(ReactiveIdentifier),
    RegisterRoot {
        root: ReactiveIdentifier,
        callback: RootCallback,
    },
    Terminate {
        cause: String,
    },
    Snapshot {
        reply: Sender<LedgerSnapshot>,
    },
    Stop,
}

/// Write-only address of the monitor actor.
///
/// Every call is a fire-and-forget message send; none of them block.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    tx: Sender<MonitorMsg>,
}

impl MonitorHandle {
    fn send(&self, msg: MonitorMsg) {
        if self.tx.send(msg).is_err() {
            debug!("monitor stopped; dropping message");
        }
    }

    /// Record one answer created at `id`.
    pub fn create_answer(&self, id: ReactiveIdentifier) {
        self.send(MonitorMsg::CreateAnswer(id));
    }

    /// Record one answer `publisher` created for `subscriber` alone.
    ///
    /// Used by stages that copy a packet to several subscribers: each copy is
    /// only in flight for the branch that will consume it.
    pub fn create_answer_for(&self, publisher: ReactiveIdentifier, subscriber: ReactiveIdentifier) {
        self.send(MonitorMsg::CreateAnswerFor { publisher, subscriber });
    }

    /// Record one answer consumed at `id`.
    pub fn consume_answer(&self, id: ReactiveIdentifier) {
        self.send(MonitorMsg::ConsumeAnswer(id));
    }

    /// Record a dataflow edge: `subscriber` pulls from `publisher`.
    pub fn register_path(&self, subscriber: ReactiveIdentifier, publisher: ReactiveIdentifier) {
        self.send(MonitorMsg::RegisterPath {
            subscriber,
            publisher,
        });
    }

    /// Announce a source stage.
    pub fn register_source(&self, source: ReactiveIdentifier) {
        self.send(MonitorMsg::RegisterSource(source));
    }

    /// A source has no packets left.
    pub fn source_finished(&self, source: ReactiveIdentifier) {
        self.send(MonitorMsg::SourceFinished(source));
    }

    /// Ask to be told when `root` is finished or failed.
    pub fn register_root(&self, root: ReactiveIdentifier, callback: RootCallback) {
        self.send(MonitorMsg::RegisterRoot { root, callback });
    }

    /// Abort the resolution: every root is failed with `cause`.
    pub fn terminate(&self, cause: impl Into<String>) {
        self.send(MonitorMsg::Terminate { cause: cause.into() });
    }

    /// Copy of the ledger, taken after every message sent before this call.
    pub fn snapshot(&self, timeout: Duration) -> ReactiveResult<LedgerSnapshot> {
        let (reply, rx) = bounded(1);
        self.tx.send(MonitorMsg::Snapshot { reply }).map_err(|_| disconnected())?;
        rx.recv_timeout(timeout).map_err(|err| match err {
            crossbeam_channel::RecvTimeoutError::Timeout => ReactiveError::Execution(ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            crossbeam_channel::RecvTimeoutError::Disconnected => disconnected(),
        })
    }
}

fn disconnected() -> ReactiveError {
    ReactiveError::Execution(ExecutionError::Disconnected {
        path: "monitor".to_string(),
    })
}

/// The monitor actor: a worker thread plus its handle.
#[derive(Debug)]
pub struct Monitor {
    handle: MonitorHandle,
    join: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Spawn the monitor worker.
    pub fn spawn(name: &str) -> ReactiveResult<Self> {
        let (tx, rx) = unbounded::<MonitorMsg>();
        let join = thread::Builder::new()
            .name(format!("{name}-monitor"))
            .spawn(move || worker_loop(rx))
            .map_err(|e| WiringError::SpawnFailed { message: e.to_string() })?;
        Ok(Self {
            handle: MonitorHandle { tx },
            join: Some(join),
        })
    }

    /// Address used by stages.
    #[must_use]
    pub fn handle(&self) -> MonitorHandle {
        self.handle.clone()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        // Blocks hold handles of their own, so the channel never closes on its
        // own; stop explicitly and wait for the worker.
        let _ = self.handle.tx.send(MonitorMsg::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

struct RootEntry {
    callback: RootCallback,
    done: bool,
}

struct MonitorState {
    ledger: AnswerLedger,
    roots: HashMap<ReactiveIdentifier, RootEntry>,
    terminated: Option<String>,
}

impl MonitorState {
    fn check_roots(&mut self) {
        if self.terminated.is_some() {
            return;
        }
        for (root, entry) in &mut self.roots {
            if !entry.done && self.ledger.is_exhausted(*root) {
                entry.done = true;
                debug!(root = %root, "root finished");
                (entry.callback)(RootSignal::Finished);
            }
        }
    }

    fn terminate(&mut self, cause: String) {
        if self.terminated.is_some() {
            return;
        }
        warn!(cause = %cause, "resolution terminated");
        for entry in self.roots.values_mut().filter(|e| !e.done) {
            entry.done = true;
            (entry.callback)(RootSignal::Failed(cause.clone()));
        }
        self.terminated = Some(cause);
    }
}

fn worker_loop(rx: Receiver<MonitorMsg>) {
    let mut state = MonitorState {
        ledger: AnswerLedger::new(),
        roots: HashMap::new(),
        terminated: None,
    };

    while let Ok(msg) = rx.recv() {
        match msg {
            MonitorMsg::CreateAnswer(id) => state.ledger.create_answer(id),
            MonitorMsg::CreateAnswerFor { publisher, subscriber } => {
                state.ledger.create_answer_for(publisher, subscriber);
            }
            MonitorMsg::ConsumeAnswer(id) => {
                state.ledger.consume_answer(id);
                state.check_roots();
            }
            MonitorMsg::RegisterPath { subscriber, publisher } => {
                state.ledger.register_path(subscriber, publisher);
            }
            MonitorMsg::RegisterSource(id) => state.ledger.register_source(id),
            MonitorMsg::SourceFinished(id) => {
                state.ledger.source_finished(id);
                state.check_roots();
            }
            MonitorMsg::RegisterRoot { root, callback } => {
                if let Some(cause) = &state.terminated {
                    callback(RootSignal::Failed(cause.clone()));
                    state.roots.insert(root, RootEntry { callback, done: true });
                } else {
                    state.roots.insert(root, RootEntry { callback, done: false });
                }
            }
            MonitorMsg::Terminate { cause } => state.terminate(cause),
            MonitorMsg::Snapshot { reply } => {
                let _ = reply.send(state.ledger.snapshot(state.terminated.clone()));
            }
            MonitorMsg::Stop => break,
        }
    }
    info!(roots = state.roots.len(), "monitor stopped");
}
