//! The cooperative task driving one user processor.
//!
//! A tasklet owns N ordered inbound streams, M outbound edges behind one
//! broadcast outbox, and the user processor. The external scheduler invokes
//! [`WatermarkingTasklet::call`] repeatedly; each call performs at most one
//! step of work and reports what it achieved. The tasklet merges watermarks
//! across its inbound streams (see [`crate::watermark`]) and forwards the
//! coalesced watermark downstream once the processor has absorbed it.

use tracing::debug;

use crate::edge::{EdgeOutbox, InboundStream, Outbox};
use crate::error::{Error, Result};
use crate::message::{ProgressState, StreamItem, Watermark};
use crate::processor::{Context, Inbox, Processor};
use crate::watermark::WatermarkCoordinator;

enum State {
    Running,
    /// All inbound streams are exhausted; draining the processor.
    Completing,
    Done,
}

#[derive(Clone, Copy)]
enum Intake {
    Data,
    Watermark,
    StreamDone,
    Nothing,
}

pub struct WatermarkingTasklet {
    context: Context,
    processor: Box<dyn Processor>,
    instreams: Vec<Box<dyn InboundStream>>,
    outbox: EdgeOutbox,
    inbox: Inbox,
    /// Ordinal the inbox was filled from; leftovers are re-presented with it.
    inbox_ordinal: usize,
    /// Round-robin position for the next intake.
    cursor: usize,
    coordinator: WatermarkCoordinator,
    /// Watermark being absorbed/forwarded; survives across calls until every
    /// outbound edge has accepted it.
    pending: Option<Watermark>,
    /// The processor has been handed the pending watermark at least once;
    /// any unfinished outbox item is from that chain and re-calling is safe.
    pending_started: bool,
    pending_absorbed: bool,
    stream_done: Vec<bool>,
    live_streams: usize,
    state: State,
    initialized: bool,
}

impl WatermarkingTasklet {
    pub fn new(
        task_name: impl Into<String>,
        processor: Box<dyn Processor>,
        instreams: Vec<Box<dyn InboundStream>>,
        outbox: EdgeOutbox,
        max_watermark_retain_millis: i64,
    ) -> Self {
        let stream_count = instreams.len();
        WatermarkingTasklet {
            context: Context::new(task_name, 0),
            processor,
            coordinator: WatermarkCoordinator::new(stream_count, max_watermark_retain_millis),
            instreams,
            outbox,
            inbox: Inbox::default(),
            inbox_ordinal: 0,
            cursor: 0,
            pending: None,
            pending_started: false,
            pending_absorbed: false,
            stream_done: vec![false; stream_count],
            live_streams: stream_count,
            state: if stream_count == 0 {
                State::Completing
            } else {
                State::Running
            },
            initialized: false,
        }
    }

    /// Inherited from the user processor.
    pub fn is_cooperative(&self) -> bool {
        self.processor.is_cooperative()
    }

    /// Must be called once before the first [`call`](Self::call).
    pub fn init(&mut self) -> Result<()> {
        self.processor.init(&self.context)?;
        self.initialized = true;
        Ok(())
    }

    /// Performs one step of work. `now_nanos` is the scheduler's monotonic
    /// clock; it drives the watermark retention timer.
    pub fn call(&mut self, now_nanos: u64) -> Result<ProgressState> {
        if !self.initialized {
            return Err(Error::Processor(format!(
                "tasklet {} called before init",
                self.context.task_name
            )));
        }
        if matches!(self.state, State::Done) {
            return Ok(ProgressState::WasAlreadyDone);
        }
        self.coordinator.note_call(now_nanos);

        // unfinished work from an earlier call comes first
        if self.can_process_pending() {
            return self.process_pending_watermark();
        }
        if !self.inbox.is_empty() {
            let progress = self.process_inbox();
            self.check_watermark_emission(now_nanos);
            return progress;
        }
        if matches!(self.state, State::Completing) && self.pending.is_none() {
            return self.complete_processor();
        }

        match self.intake(now_nanos) {
            Intake::Data => {
                let progress = self.process_inbox();
                self.check_watermark_emission(now_nanos);
                progress
            }
            Intake::Watermark => {
                self.check_watermark_emission(now_nanos);
                if self.can_process_pending() {
                    self.process_pending_watermark()?;
                }
                Ok(ProgressState::MadeProgress)
            }
            Intake::StreamDone => {
                self.check_watermark_emission(now_nanos);
                Ok(ProgressState::MadeProgress)
            }
            Intake::Nothing => {
                self.processor.try_process(&mut self.outbox)?;
                self.check_watermark_emission(now_nanos);
                if self.can_process_pending() {
                    return self.process_pending_watermark();
                }
                Ok(ProgressState::NoProgress)
            }
        }
    }

    /// Takes the head of the next non-empty inbound stream, round-robin.
    fn intake(&mut self, now_nanos: u64) -> Intake {
        let stream_count = self.instreams.len();
        for step in 0..stream_count {
            let ordinal = (self.cursor + step) % stream_count;
            if self.stream_done[ordinal] {
                continue;
            }
            let head = match self.instreams[ordinal].peek() {
                None => continue,
                Some(StreamItem::Message(_)) => Intake::Data,
                Some(StreamItem::Watermark(_)) => Intake::Watermark,
                Some(StreamItem::EndOfStream) => Intake::StreamDone,
            };
            self.cursor = (ordinal + 1) % stream_count;
            match head {
                Intake::Data => self.fill_inbox(ordinal),
                Intake::Watermark => {
                    if let Some(StreamItem::Watermark(wm)) = self.instreams[ordinal].poll() {
                        debug!("observed {} on ordinal {}", wm, ordinal);
                        self.coordinator.observe(ordinal, wm.timestamp(), now_nanos);
                    }
                }
                Intake::StreamDone => {
                    self.instreams[ordinal].remove();
                    debug!("inbound stream {} is done", ordinal);
                    self.coordinator.mark_done(ordinal);
                    self.stream_done[ordinal] = true;
                    self.live_streams -= 1;
                    if self.live_streams == 0 {
                        self.state = State::Completing;
                    }
                }
                Intake::Nothing => {}
            }
            return head;
        }
        Intake::Nothing
    }

    /// Moves the leading run of adjacent data items into the inbox.
    fn fill_inbox(&mut self, ordinal: usize) {
        let stream = &mut self.instreams[ordinal];
        while matches!(stream.peek(), Some(StreamItem::Message(_))) {
            if let Some(StreamItem::Message(msg)) = stream.poll() {
                self.inbox.push(msg);
            }
        }
        self.inbox_ordinal = ordinal;
    }

    fn process_inbox(&mut self) -> Result<ProgressState> {
        let before = self.inbox.len();
        self.processor
            .process(self.inbox_ordinal, &mut self.inbox, &mut self.outbox)?;
        if self.inbox.len() < before {
            Ok(ProgressState::MadeProgress)
        } else {
            Ok(ProgressState::NoProgress)
        }
    }

    fn check_watermark_emission(&mut self, now_nanos: u64) {
        if self.pending.is_some() {
            return;
        }
        if let Some(timestamp) = self.coordinator.eligible(now_nanos) {
            self.pending = Some(Watermark::new(timestamp));
            self.pending_started = false;
            self.pending_absorbed = false;
        }
    }

    /// Whether the pending watermark may be worked on right now. Starting a
    /// new watermark chain must wait until the outbox has no half-delivered
    /// item from the processor; re-entering an already started chain is
    /// always safe because the processor retries its own unfinished item.
    fn can_process_pending(&self) -> bool {
        self.pending.is_some() && (self.pending_started || !self.outbox.has_unfinished())
    }

    /// Drives the pending watermark through the processor and then out to
    /// every outbound edge, yielding on every refusal.
    fn process_pending_watermark(&mut self) -> Result<ProgressState> {
        let Some(wm) = self.pending else {
            return Ok(ProgressState::NoProgress);
        };
        if !self.pending_absorbed {
            self.pending_started = true;
            if !self.processor.try_process_watermark(wm, &mut self.outbox)? {
                return Ok(ProgressState::MadeProgress);
            }
            self.pending_absorbed = true;
        }
        if self.outbox.offer(StreamItem::Watermark(wm)) {
            debug!("forwarded {}", wm);
            self.coordinator.record_emitted(wm.timestamp());
            self.pending = None;
            self.pending_started = false;
            self.pending_absorbed = false;
            Ok(ProgressState::MadeProgress)
        } else if self.outbox.delivered_last_offer() > 0 {
            Ok(ProgressState::MadeProgress)
        } else {
            Ok(ProgressState::NoProgress)
        }
    }

    fn complete_processor(&mut self) -> Result<ProgressState> {
        if self.processor.complete(&mut self.outbox)? {
            debug!("tasklet {} is done", self.context.task_name);
            self.state = State::Done;
            Ok(ProgressState::Done)
        } else {
            Ok(ProgressState::MadeProgress)
        }
    }
}
