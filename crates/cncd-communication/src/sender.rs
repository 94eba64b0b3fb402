//! Program streamer
//!
//! The Sender streams a loaded G-code program line by line under a
//! firmware-appropriate flow-control strategy:
//!
//! - **send-response**: one line on the wire at a time; the next goes out
//!   only after the previous `ok` (Marlin).
//! - **char-counting**: the total byte length of unacknowledged lines
//!   (each counted with its trailing LF) never exceeds the firmware's
//!   input buffer (Grbl, Smoothieware).
//! - **queue-reports**: a bounded window replenished by the planner-queue
//!   depth the firmware reports in `qr` events (TinyG/g2core).
//!
//! The Sender is a pull-driven state machine: [`Sender::next`] returns the
//! lines to write and any program-pause request raised by an inline
//! sentinel; the Controller owns the wire and the Workflow.

use cncd_core::{translate_line, Context, HoldReason, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::time::Instant;

/// Trailer appended to every loaded program so the terminal dwell trips
/// the finish detector once the planner is empty.
pub const WAIT_TRAILER: &str = "%wait ; Wait for the planner to empty";

/// Flow-control strategy for a streamed program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamingMode {
    /// One outstanding line; wait for `ok` before the next
    SendResponse,
    /// Keep unacked byte total within the firmware input buffer
    CharCounting {
        /// Firmware input buffer size in bytes
        buffer_size: usize,
    },
    /// Window replenished by firmware queue reports
    QueueReports {
        /// Planner queue depth when empty
        queue_size: usize,
        /// Stop sending when reported free slots drop to this level
        low_water: usize,
    },
}

/// What [`Sender::next`] produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SenderOutput {
    /// A line for the wire (no trailing LF)
    Data(String),
    /// A program-level pause request raised by `M0`/`M1`/`M6`
    Pause(HoldReason),
}

/// Snapshot multicast to clients as `sender:status` and returned by
/// `sender:load`. Round-trips through serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderStatus {
    /// Streaming protocol descriptor
    pub sp: StreamingMode,
    /// Whether emission is held
    pub hold: bool,
    /// Why, when held
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_reason: Option<HoldReason>,
    /// Loaded program name
    pub name: String,
    /// Program size in bytes
    pub size: usize,
    /// Total line count
    pub total: usize,
    /// Lines handed to the wire (or consumed silently)
    pub sent: usize,
    /// Lines acknowledged
    pub received: usize,
    /// Expression context the program runs against
    pub context: Context,
    /// Milliseconds spent streaming so far
    #[serde(default)]
    pub elapsed_ms: u64,
    /// Estimated milliseconds left, projected from the pace so far
    #[serde(default)]
    pub remaining_ms: u64,
    /// True once every line has been acknowledged
    #[serde(default)]
    pub finished: bool,
}

/// Streams a loaded program under a flow-control strategy.
#[derive(Debug)]
pub struct Sender {
    mode: StreamingMode,
    name: String,
    content: String,
    lines: Vec<String>,
    context: Context,
    sent: usize,
    received: usize,
    /// Unacked bytes on the wire (char-counting)
    pending_bytes: usize,
    /// Byte length (incl. LF) of each unacked wire line, FIFO
    line_lengths: VecDeque<usize>,
    /// Free planner slots (queue-reports)
    queue_slots: usize,
    hold: bool,
    hold_reason: Option<HoldReason>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl Sender {
    /// Create an unloaded sender with the given flow-control mode
    pub fn new(mode: StreamingMode) -> Self {
        let queue_slots = match mode {
            StreamingMode::QueueReports { queue_size, .. } => queue_size,
            _ => 0,
        };
        Self {
            mode,
            name: String::new(),
            content: String::new(),
            lines: Vec::new(),
            context: Context::new(),
            sent: 0,
            received: 0,
            pending_bytes: 0,
            line_lengths: VecDeque::new(),
            queue_slots,
            hold: false,
            hold_reason: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Load a program. Appends the planner-drain trailer, splits on LF,
    /// and drops blank lines. Counters are reset.
    pub fn load(&mut self, name: impl Into<String>, content: &str, context: Context) {
        let full = format!("{}\n{}", content.trim_end_matches('\n'), WAIT_TRAILER);
        self.lines = full
            .split('\n')
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();
        self.name = name.into();
        self.content = full;
        self.context = context;
        self.rewind();
    }

    /// Drop the loaded program
    pub fn unload(&mut self) {
        self.name.clear();
        self.content.clear();
        self.lines.clear();
        self.context = Context::new();
        self.rewind();
    }

    /// Whether a program is loaded
    pub fn is_loaded(&self) -> bool {
        !self.lines.is_empty()
    }

    /// Reset counters for a fresh start; the program stays loaded.
    pub fn rewind(&mut self) {
        self.sent = 0;
        self.received = 0;
        self.pending_bytes = 0;
        self.line_lengths.clear();
        self.queue_slots = match self.mode {
            StreamingMode::QueueReports { queue_size, .. } => queue_size,
            _ => 0,
        };
        self.hold = false;
        self.hold_reason = None;
        self.started_at = None;
        self.finished_at = None;
    }

    /// Block emission
    pub fn hold(&mut self, reason: Option<HoldReason>) {
        self.hold = true;
        self.hold_reason = reason;
    }

    /// Release a hold
    pub fn unhold(&mut self) {
        self.hold = false;
        self.hold_reason = None;
    }

    /// Whether emission is held
    pub fn held(&self) -> bool {
        self.hold
    }

    /// Lines handed out so far
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Lines acknowledged so far
    pub fn received(&self) -> usize {
        self.received
    }

    /// Total line count of the loaded program
    pub fn total(&self) -> usize {
        self.lines.len()
    }

    /// Unacked wire bytes (char-counting)
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Whether there are lines not yet handed out
    pub fn peek(&self) -> bool {
        self.sent < self.lines.len()
    }

    /// True once every line has been acknowledged
    pub fn finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// When the program finished, if it has
    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    /// Update the free-slot window from a firmware queue report
    pub fn update_queue_slots(&mut self, free: usize) {
        self.queue_slots = free;
    }

    fn can_send(&self, wire_len: usize) -> bool {
        match self.mode {
            StreamingMode::SendResponse => self.sent == self.received,
            StreamingMode::CharCounting { buffer_size } => {
                self.pending_bytes + wire_len <= buffer_size
            }
            StreamingMode::QueueReports { low_water, .. } => self.queue_slots > low_water,
        }
    }

    /// Emit as many lines as the flow-control window allows.
    ///
    /// Lines that reduce to nothing (comments, assignments) are consumed
    /// and self-acknowledged. A pause word emits its line, raises a
    /// [`SenderOutput::Pause`], and stops emission; `%wait` emits its
    /// dwell and holds the Sender until all outstanding acks arrive.
    pub fn next(&mut self) -> Result<Vec<SenderOutput>> {
        let mut out = Vec::new();

        while !self.hold && self.sent < self.lines.len() {
            let raw = self.lines[self.sent].clone();
            let translated = translate_line(&raw, &mut self.context)?;

            let line = match translated.output {
                Some(line) if !line.is_empty() => line,
                _ => {
                    // Nothing reaches the wire; account for the line
                    self.sent += 1;
                    self.received += 1;
                    self.maybe_finish();
                    continue;
                }
            };

            let wire_len = line.len() + 1;
            if !self.can_send(wire_len) {
                break;
            }

            if self.started_at.is_none() {
                self.started_at = Some(Instant::now());
            }

            self.sent += 1;
            self.pending_bytes += wire_len;
            self.line_lengths.push_back(wire_len);
            if let StreamingMode::QueueReports { .. } = self.mode {
                self.queue_slots = self.queue_slots.saturating_sub(1);
            }
            out.push(SenderOutput::Data(line));

            if translated.wait {
                self.hold = true;
                self.hold_reason = Some(HoldReason::Data("%wait".to_string()));
                break;
            }
            if let Some(word) = translated.pause {
                out.push(SenderOutput::Pause(HoldReason::Data(
                    word.as_str().to_string(),
                )));
                break;
            }
        }

        Ok(out)
    }

    /// Credit one outstanding line. Returns false (and logs) when no line
    /// is outstanding — an `ok` must never advance `received` past `sent`.
    pub fn ack(&mut self) -> bool {
        if self.received >= self.sent {
            tracing::error!(
                received = self.received,
                sent = self.sent,
                "ack with no outstanding line"
            );
            return false;
        }
        self.received += 1;
        if let Some(len) = self.line_lengths.pop_front() {
            self.pending_bytes = self.pending_bytes.saturating_sub(len);
        }
        self.maybe_finish();
        true
    }

    fn maybe_finish(&mut self) {
        if !self.lines.is_empty()
            && self.received == self.lines.len()
            && self.sent == self.lines.len()
            && self.finished_at.is_none()
        {
            self.finished_at = Some(Instant::now());
        }
    }

    /// Status snapshot for `sender:status`
    pub fn status(&self) -> SenderStatus {
        let elapsed_ms = match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => end.duration_since(start).as_millis() as u64,
            (Some(start), None) => start.elapsed().as_millis() as u64,
            _ => 0,
        };
        // Project the average time per acknowledged line over what is left
        let remaining_ms = if self.finished() || self.received == 0 || elapsed_ms == 0 {
            0
        } else {
            let remaining_lines = (self.lines.len() - self.received) as u64;
            (elapsed_ms / self.received as u64).saturating_mul(remaining_lines)
        };
        SenderStatus {
            sp: self.mode,
            hold: self.hold,
            hold_reason: self.hold_reason.clone(),
            name: self.name.clone(),
            size: self.content.len(),
            total: self.lines.len(),
            sent: self.sent,
            received: self.received,
            context: self.context.clone(),
            elapsed_ms,
            remaining_ms,
            finished: self.finished(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_data(outputs: &[SenderOutput]) -> Vec<String> {
        outputs
            .iter()
            .filter_map(|o| match o {
                SenderOutput::Data(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn load_counts_nonempty_lines_plus_trailer() {
        let mut s = Sender::new(StreamingMode::SendResponse);
        s.load("job", "G0 X1\n\nG0 X2\n", Context::new());
        // Two program lines plus the %wait trailer
        assert_eq!(s.total(), 3);
        assert_eq!(s.status().name, "job");
    }

    #[test]
    fn send_response_window_is_one() {
        let mut s = Sender::new(StreamingMode::SendResponse);
        s.load("job", "G0 X1\nG0 X2", Context::new());

        let out = s.next().unwrap();
        assert_eq!(drain_data(&out), vec!["G0 X1"]);
        assert_eq!(s.sent() - s.received(), 1);

        // Nothing more until the ack
        assert!(s.next().unwrap().is_empty());
        assert!(s.ack());
        let out = s.next().unwrap();
        assert_eq!(drain_data(&out), vec!["G0 X2"]);
    }

    #[test]
    fn char_counting_respects_buffer() {
        let mut s = Sender::new(StreamingMode::CharCounting { buffer_size: 16 });
        // Each line is 6 bytes + LF = 7
        s.load("job", "G0 X10\nG0 X20\nG0 X30", Context::new());

        let out = s.next().unwrap();
        // Two lines fit (14 <= 16); the third would overflow
        assert_eq!(drain_data(&out).len(), 2);
        assert_eq!(s.pending_bytes(), 14);

        assert!(s.ack());
        assert_eq!(s.pending_bytes(), 7);
        let out = s.next().unwrap();
        assert_eq!(drain_data(&out), vec!["G0 X30"]);
    }

    #[test]
    fn boundary_line_exactly_buffer_minus_one_is_sendable() {
        let mut s = Sender::new(StreamingMode::CharCounting { buffer_size: 10 });
        s.load("job", "G0 X12345", Context::new()); // 9 bytes + LF = 10
        let out = s.next().unwrap();
        assert_eq!(drain_data(&out), vec!["G0 X12345"]);
    }

    #[test]
    fn oversized_line_blocks() {
        let mut s = Sender::new(StreamingMode::CharCounting { buffer_size: 10 });
        s.load("job", "G0 X123456", Context::new()); // 10 bytes + LF = 11
        assert!(s.next().unwrap().is_empty());
        assert_eq!(s.sent(), 0);
    }

    #[test]
    fn ack_never_advances_past_sent() {
        let mut s = Sender::new(StreamingMode::SendResponse);
        s.load("job", "G0 X1", Context::new());
        assert!(!s.ack());
        s.next().unwrap();
        assert!(s.ack());
        assert!(!s.ack());
        assert!(s.received() <= s.sent());
    }

    #[test]
    fn wait_sentinel_holds_until_unhold() {
        let mut s = Sender::new(StreamingMode::CharCounting { buffer_size: 128 });
        s.load("job", "%wait", Context::new());
        // The program body is %wait and the trailer is another %wait
        let out = s.next().unwrap();
        assert_eq!(drain_data(&out), vec!["G4 P0.5"]);
        assert!(s.held());
        assert_eq!(
            s.status().hold_reason,
            Some(HoldReason::Data("%wait".to_string()))
        );

        assert!(s.next().unwrap().is_empty());
        s.ack();
        s.unhold();
        let out = s.next().unwrap();
        assert_eq!(drain_data(&out), vec!["G4 P0.5"]);
    }

    #[test]
    fn pause_word_raises_workflow_pause() {
        let mut s = Sender::new(StreamingMode::CharCounting { buffer_size: 128 });
        s.load("job", "G0 X1\nM6\nG0 X2", Context::new());
        let out = s.next().unwrap();
        assert_eq!(
            out.last(),
            Some(&SenderOutput::Pause(HoldReason::Data("M6".to_string())))
        );
        let data = drain_data(&out);
        assert_eq!(data, vec!["G0 X1", "(M6)"]);
    }

    #[test]
    fn silent_lines_self_acknowledge() {
        let mut s = Sender::new(StreamingMode::SendResponse);
        s.load("job", "; header\nG0 X1\n; footer", Context::new());
        let out = s.next().unwrap();
        assert_eq!(drain_data(&out), vec!["G0 X1"]);
        // Both comments consumed silently; only G0 X1 awaits its ack
        assert_eq!(s.sent(), 3);
        assert_eq!(s.received(), 2);
    }

    #[test]
    fn finish_requires_all_acks() {
        let mut s = Sender::new(StreamingMode::SendResponse);
        s.load("job", "G0 X1", Context::new());

        // G0 X1, then the dwell from the trailer
        for _ in 0..2 {
            let out = s.next().unwrap();
            assert_eq!(drain_data(&out).len(), 1);
            assert!(!s.finished());
            s.unhold(); // release the trailer hold once acked
            s.ack();
        }
        assert!(s.finished());
        assert_eq!(s.received(), s.total());
    }

    #[test]
    fn rewind_resets_counters_but_keeps_program() {
        let mut s = Sender::new(StreamingMode::CharCounting { buffer_size: 128 });
        s.load("job", "G0 X1\nG0 X2", Context::new());
        s.next().unwrap();
        s.ack();
        s.rewind();
        assert_eq!((s.sent(), s.received(), s.pending_bytes()), (0, 0, 0));
        assert!(s.is_loaded());
        assert_eq!(s.total(), 3);
    }

    #[test]
    fn queue_reports_windowing() {
        let mut s = Sender::new(StreamingMode::QueueReports {
            queue_size: 6,
            low_water: 4,
        });
        s.load("job", "G0 X1\nG0 X2\nG0 X3\nG0 X4", Context::new());

        // 6 free slots, low water 4: two lines go out
        let out = s.next().unwrap();
        assert_eq!(drain_data(&out).len(), 2);

        // Firmware reports more room: the rest drains, trailer dwell last
        s.update_queue_slots(8);
        let out = s.next().unwrap();
        let data = drain_data(&out);
        assert_eq!(data.len(), 3);
        assert_eq!(data.last().map(String::as_str), Some("G4 P0.5"));
        assert!(s.held());
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_time_tracks_pace() {
        let mut s = Sender::new(StreamingMode::SendResponse);
        s.load("job", "G0 X1\nG0 X2\nG0 X3", Context::new());

        // Nothing acked yet: no estimate
        assert_eq!(s.status().remaining_ms, 0);

        s.next().unwrap();
        tokio::time::advance(std::time::Duration::from_millis(100)).await;
        s.ack();

        // One of four lines acked in 100 ms: three lines to go
        assert_eq!(s.status().remaining_ms, 300);

        // Drain the rest; a finished program has nothing remaining
        for _ in 0..3 {
            s.unhold();
            s.next().unwrap();
            s.ack();
        }
        assert!(s.finished());
        assert_eq!(s.status().remaining_ms, 0);
    }

    #[test]
    fn status_round_trips() {
        let mut s = Sender::new(StreamingMode::CharCounting { buffer_size: 128 });
        let mut ctx = Context::new();
        ctx.set("posx", 1.5);
        s.load("part.nc", "G0 X1\nG0 X2", ctx);
        s.next().unwrap();
        s.ack();

        let status = s.status();
        let json = serde_json::to_string(&status).unwrap();
        let back: SenderStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, status.name);
        assert_eq!(back.size, status.size);
        assert_eq!(back.total, status.total);
        assert_eq!(back.sent, status.sent);
        assert_eq!(back.received, status.received);
        assert_eq!(back.sp, status.sp);
        assert_eq!(back.context, status.context);
    }
}
