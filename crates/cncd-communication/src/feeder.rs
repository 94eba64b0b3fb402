//! Ad-hoc command queue
//!
//! The Feeder holds one-off lines (jogs, console input, macros) and emits
//! them one at a time. The Controller polls it with [`Feeder::next`] each
//! time the firmware acknowledges the previous line; a hold raised by a
//! pause word (`M0`, `M1`, `M6`) blocks further emission until the
//! operator releases it with `feeder:start`.

use cncd_core::{translate_line, Context, HoldReason, Result, WAIT_DWELL};
use serde::Serialize;
use std::collections::VecDeque;

/// One queued line with its expression context.
#[derive(Debug, Clone)]
pub struct FeederItem {
    /// Raw line as fed
    pub line: String,
    /// Context for `%` assignments and `[expr]` substitution
    pub context: Context,
}

/// A line ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct FeederData {
    /// Filtered line (no trailing LF)
    pub line: String,
    /// Context the line was filtered against
    pub context: Context,
}

/// Snapshot multicast to clients as `feeder:status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeederStatus {
    /// Queued line count
    pub queue: usize,
    /// Whether emission is held
    pub hold: bool,
    /// Why, when held
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold_reason: Option<HoldReason>,
}

/// FIFO of ad-hoc command lines with hold/resume.
#[derive(Debug, Default)]
pub struct Feeder {
    queue: VecDeque<FeederItem>,
    hold: bool,
    hold_reason: Option<HoldReason>,
}

impl Feeder {
    /// Create an empty feeder
    pub fn new() -> Self {
        Self::default()
    }

    /// Append lines sharing one context
    pub fn feed(&mut self, lines: &[String], context: Context) {
        for line in lines {
            self.queue.push_back(FeederItem {
                line: line.clone(),
                context: context.clone(),
            });
        }
    }

    /// Queued line count
    pub fn size(&self) -> usize {
        self.queue.len()
    }

    /// Whether any lines are queued
    pub fn peek(&self) -> bool {
        !self.queue.is_empty()
    }

    /// True when lines are queued and emission is not held
    pub fn is_pending(&self) -> bool {
        !self.queue.is_empty() && !self.hold
    }

    /// Whether emission is held
    pub fn held(&self) -> bool {
        self.hold
    }

    /// Drop all queued lines and release any hold
    pub fn reset(&mut self) {
        self.queue.clear();
        self.hold = false;
        self.hold_reason = None;
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

    /// Emit the next non-empty line, if any.
    ///
    /// Assignment and comment-only lines are consumed without emission.
    /// A pause word raises a hold after its own line is emitted, so the
    /// pause line itself still reaches the firmware.
    pub fn next(&mut self) -> Result<Option<FeederData>> {
        if self.hold {
            return Ok(None);
        }

        while let Some(item) = self.queue.pop_front() {
            let mut context = item.context;
            let translated = translate_line(&item.line, &mut context)?;

            if let Some(word) = translated.pause {
                self.hold = true;
                self.hold_reason = Some(HoldReason::Data(word.as_str().to_string()));
            }
            debug_assert!(!translated.wait || translated.output.as_deref() == Some(WAIT_DWELL));

            match translated.output {
                Some(line) if !line.is_empty() => {
                    return Ok(Some(FeederData { line, context }));
                }
                _ => continue,
            }
        }

        Ok(None)
    }

    /// Status snapshot for `feeder:status`
    pub fn status(&self) -> FeederStatus {
        FeederStatus {
            queue: self.queue.len(),
            hold: self.hold,
            hold_reason: self.hold_reason.clone(),
        }
    }
}
