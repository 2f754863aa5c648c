//! Terminal subscriber side: how a caller drains answers.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::error::{ExecutionError, ReactiveResult};
use crate::reactive::block::{BlockHandle, BlockMsg};
use crate::reactive::identifier::ReactiveIdentifier;
use crate::reactive::Packet;

/// What a sink reports to its [`AnswerStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent<P> {
    /// One answer.
    Answer(P),
    /// No further answers will ever arrive.
    Done,
    /// The resolution was terminated.
    Failed(String),
}

/// Blocking iterator over the answers of one sink.
///
/// Every call to [`AnswerStream::next_answer`] issues at most one pull into the
/// network, so answers are computed only as fast as they are consumed.
pub struct AnswerStream<P: Packet> {
    sink: ReactiveIdentifier,
    block: BlockHandle<P>,
    rx: Receiver<SinkEvent<P>>,
    timeout: Duration,
    finished: bool,
    failure: Option<String>,
}

impl<P: Packet> AnswerStream<P> {
    pub(crate) fn new(sink: ReactiveIdentifier, block: BlockHandle<P>, rx: Receiver<SinkEvent<P>>) -> Self {
        let timeout = block.config().answer_timeout();
        Self {
            sink,
            block,
            rx,
            timeout,
            finished: false,
            failure: None,
        }
    }

    /// The sink stage feeding this stream.
    #[must_use]
    pub const fn identifier(&self) -> ReactiveIdentifier {
        self.sink
    }

    /// Whether the network reported that no more answers will come.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next answer, waiting up to the configured answer timeout.
    ///
    /// `Ok(None)` means the resolution is complete.
    pub fn next_answer(&mut self) -> ReactiveResult<Option<P>> {
        self.next_timeout(self.timeout)
    }

    /// Next answer, waiting up to `timeout`.
    ///
    /// A timeout leaves the stream usable; the outstanding pull is not
    /// repeated by the next call.
    pub fn next_timeout(&mut self, timeout: Duration) -> ReactiveResult<Option<P>> {
        if self.finished {
            return Ok(None);
        }
        if let Some(cause) = &self.failure {
            return Err(ExecutionError::Terminated { cause: cause.clone() }.into());
        }

        match self.rx.try_recv() {
            Ok(event) => return self.accept(event),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return Err(self.disconnected()),
        }

        self.block.send(BlockMsg::Demand { sink: self.sink })?;
        match self.rx.recv_timeout(timeout) {
            Ok(event) => self.accept(event),
            Err(RecvTimeoutError::Timeout) => Err(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }
            .into()),
            Err(RecvTimeoutError::Disconnected) => Err(self.disconnected()),
        }
    }

    /// Drain every remaining answer.
    pub fn collect_remaining(&mut self) -> ReactiveResult<Vec<P>> {
        let mut answers = Vec::new();
        while let Some(answer) = self.next_answer()? {
            answers.push(answer);
        }
        Ok(answers)
    }

    fn accept(&mut self, event: SinkEvent<P>) -> ReactiveResult<Option<P>> {
        match event {
            SinkEvent::Answer(packet) => Ok(Some(packet)),
            SinkEvent::Done => {
                self.finished = true;
                Ok(None)
            }
            SinkEvent::Failed(cause) => {
                self.failure = Some(cause.clone());
                Err(ExecutionError::Terminated { cause }.into())
            }
        }
    }

    fn disconnected(&self) -> crate::error::ReactiveError {
        ExecutionError::Disconnected {
            path: self.sink.to_string(),
        }
        .into()
    }
}

impl<P: Packet> Iterator for AnswerStream<P> {
    type Item = ReactiveResult<P>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failure.is_some() {
            return None;
        }
        self.next_answer().transpose()
    }
}
