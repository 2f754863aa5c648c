//! Optional tracing of pulls and packets for visualization and debugging.
//!
//! The engine tolerates the complete absence of a tracer: every trace call is
//! behind an `Option`. Tracers are shared by all blocks, so implementations must
//! be `Send + Sync`.

use std::fmt::Debug;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::warn;

use crate::error::ReactiveResult;
use crate::reactive::identifier::ReactiveIdentifier;

/// Receiver of pull and packet events.
pub trait Tracer<P>: Send + Sync {
    /// `subscriber` pulled `publisher`.
    fn pull(&self, subscriber: &ReactiveIdentifier, publisher: &ReactiveIdentifier);

    /// `subscriber` received `packet` from `publisher`.
    fn receive(&self, publisher: &ReactiveIdentifier, subscriber: &ReactiveIdentifier, packet: &P);
}

/// One traced event.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent<P> {
    Pull {
        subscriber: ReactiveIdentifier,
        publisher: ReactiveIdentifier,
    },
    Receive {
        publisher: ReactiveIdentifier,
        subscriber: ReactiveIdentifier,
        packet: P,
    },
}

/// Keeps every event in memory.
#[derive(Debug)]
pub struct RecordingTracer<P> {
    events: Mutex<Vec<TraceEvent<P>>>,
}

impl<P> Default for RecordingTracer<P> {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }
}

impl<P: Clone> RecordingTracer<P> {
    /// Empty tracer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded so far, in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<TraceEvent<P>> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Number of pulls `publisher` has received.
    #[must_use]
    pub fn pull_count(&self, publisher: &ReactiveIdentifier) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, TraceEvent::Pull { publisher: p, .. } if p == publisher))
            .count()
    }

    /// Packets `subscriber` received, in arrival order.
    #[must_use]
    pub fn received_by(&self, subscriber: &ReactiveIdentifier) -> Vec<P> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TraceEvent::Receive { subscriber: s, packet, .. } if s == *subscriber => Some(packet),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: TraceEvent<P>) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl<P: Clone + Send> Tracer<P> for RecordingTracer<P> {
    fn pull(&self, subscriber: &ReactiveIdentifier, publisher: &ReactiveIdentifier) {
        self.record(TraceEvent::Pull {
            subscriber: *subscriber,
            publisher: *publisher,
        });
    }

    fn receive(&self, publisher: &ReactiveIdentifier, subscriber: &ReactiveIdentifier, packet: &P) {
        self.record(TraceEvent::Receive {
            publisher: *publisher,
            subscriber: *subscriber,
            packet: packet.clone(),
        });
    }
}

/// Writes pulls and packets as a directed graph description.
///
/// Pull edges point from subscriber to publisher; receive edges from publisher
/// to subscriber, labelled with the packet. The file is closed by
/// [`FileTracer::finish`] or on drop.
#[derive(Debug)]
pub struct FileTracer {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl FileTracer {
    /// Create `<dir>/<name>.dot` and write the graph header.
    pub fn create(dir: &Path, name: &str) -> ReactiveResult<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{name}.dot"));
        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "// reasoner trace {name} started {}", Utc::now().to_rfc3339())?;
        writeln!(writer, "digraph {{")?;
        Ok(Self {
            path,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Location of the trace file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the graph and flush. Later events are ignored.
    pub fn finish(&self) -> ReactiveResult<()> {
        let Ok(mut guard) = self.writer.lock() else {
            return Ok(());
        };
        if let Some(mut writer) = guard.take() {
            writeln!(writer, "}}")?;
            writer.flush()?;
        }
        Ok(())
    }

    fn write_edge(&self, from: &ReactiveIdentifier, to: &ReactiveIdentifier, label: &str) {
        let Ok(mut guard) = self.writer.lock() else {
            return;
        };
        if let Some(writer) = guard.as_mut() {
            let line = format!("\"{from}\" -> \"{to}\" [label=\"{}\"];", escape(label));
            if let Err(e) = writeln!(writer, "{line}") {
                warn!(path = %self.path.display(), error = %e, "failed to write trace event");
            }
        }
    }
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

impl<P: Debug> Tracer<P> for FileTracer {
    fn pull(&self, subscriber: &ReactiveIdentifier, publisher: &ReactiveIdentifier) {
        self.write_edge(subscriber, publisher, "pull");
    }

    fn receive(&self, publisher: &ReactiveIdentifier, subscriber: &ReactiveIdentifier, packet: &P) {
        self.write_edge(publisher, subscriber, &format!("{packet:?}"));
    }
}

impl Drop for FileTracer {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(path = %self.path.display(), error = %e, "failed to close trace file");
        }
    }
}
