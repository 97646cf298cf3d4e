//! Command/response correlation with single-in-flight discipline.
//!
//! The uartBridge link is half-duplex at the command level: one command
//! frame on the wire at a time, answered by one ack (telemetry may interleave
//! freely). The [`Correlator`] enforces that discipline (commands submitted
//! while one is outstanding queue FIFO) and guarantees that every pending
//! command resolves to exactly one of acked, timed out or cancelled.
//!
//! The wire protocol carries no sequence ids, so acks are matched by their
//! echoed command opcode; single-in-flight makes that unambiguous. The
//! sequence numbers assigned here are engine-local bookkeeping for logs.
//!
//! The correlator is deliberately I/O-free: it decides *what* to write and
//! *how* a pending command resolves, and the hub session performs the writes.
//! That keeps every correctness property (single-flight, FIFO order, retry
//! budget, timeout determinism) unit-testable without a transport.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use ajaxbridge_core::constants::IDEMPOTENT_RETRY_LIMIT;
use ajaxbridge_protocol::{AckStatus, Command, Opcode};

/// Verdict carried by a matched ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    pub status: AckStatus,
    pub code: u8,
}

/// One command awaiting its response.
#[derive(Debug)]
struct PendingCommand<C> {
    seq: u64,
    command: Command,
    context: C,
    deadline: Instant,
    retries_left: u32,
}

/// How a pending command left the correlator.
#[derive(Debug)]
pub enum Resolution<C> {
    Acked { context: C, outcome: AckOutcome },
    TimedOut { context: C },
    Cancelled { context: C },
}

/// What the session must do after a correlator step.
#[derive(Debug, PartialEq, Eq)]
pub enum WriteAction {
    /// Put this command on the wire now.
    Send(Command),
    /// Nothing to write.
    None,
}

pub struct Correlator<C> {
    next_seq: u64,
    timeout: Duration,
    in_flight: Option<PendingCommand<C>>,
    queue: VecDeque<PendingCommand<C>>,
}

impl<C> Correlator<C> {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_seq: 1,
            timeout,
            in_flight: None,
            queue: VecDeque::new(),
        }
    }

    /// Submit a command. Returns the write to perform (the command itself
    /// when the wire is free, nothing when it queued behind the in-flight
    /// one).
    pub fn submit(&mut self, command: Command, context: C) -> WriteAction {
        let seq = self.next_seq;
        self.next_seq += 1;

        let retries_left = if command.is_idempotent() {
            IDEMPOTENT_RETRY_LIMIT
        } else {
            0
        };
        let pending = PendingCommand {
            seq,
            command: command.clone(),
            context,
            deadline: Instant::now() + self.timeout,
            retries_left,
        };

        if self.in_flight.is_none() {
            trace!(seq, opcode = ?command.opcode(), "command in flight");
            self.in_flight = Some(pending);
            WriteAction::Send(command)
        } else {
            trace!(seq, opcode = ?command.opcode(), queued = self.queue.len() + 1, "command queued");
            self.queue.push_back(pending);
            WriteAction::None
        }
    }

    /// Feed a received ack. Returns the resolved command (if the ack matched
    /// the in-flight one) and the follow-up write for the next queued
    /// command.
    pub fn on_ack(
        &mut self,
        echoed: Opcode,
        outcome: AckOutcome,
    ) -> (Option<Resolution<C>>, WriteAction) {
        match &self.in_flight {
            Some(pending) if pending.command.opcode() == echoed => {
                let pending = self.in_flight.take().unwrap_or_else(|| unreachable!());
                trace!(seq = pending.seq, ?outcome, "command acknowledged");
                let resolution = Resolution::Acked {
                    context: pending.context,
                    outcome,
                };
                (Some(resolution), self.promote_next())
            }
            Some(pending) => {
                // With one command in flight a mismatched echo means a very
                // late ack for something already resolved; drop it.
                warn!(
                    expected = ?pending.command.opcode(),
                    got = ?echoed,
                    "ack does not match the in-flight command"
                );
                (None, WriteAction::None)
            }
            None => {
                debug!(opcode = ?echoed, "unsolicited ack");
                (None, WriteAction::None)
            }
        }
    }

    /// Handle expiry of the in-flight deadline. Idempotent commands burn a
    /// retry and go back on the wire; everything else resolves `TimedOut`
    /// and the next queued command is promoted.
    pub fn on_timeout(&mut self) -> (Option<Resolution<C>>, WriteAction) {
        let Some(mut pending) = self.in_flight.take() else {
            return (None, WriteAction::None);
        };

        if pending.retries_left > 0 {
            pending.retries_left -= 1;
            pending.deadline = Instant::now() + self.timeout;
            let command = pending.command.clone();
            debug!(
                seq = pending.seq,
                retries_left = pending.retries_left,
                opcode = ?command.opcode(),
                "command timed out, retrying"
            );
            self.in_flight = Some(pending);
            return (None, WriteAction::Send(command));
        }

        warn!(seq = pending.seq, opcode = ?pending.command.opcode(), "command timed out");
        let resolution = Resolution::TimedOut {
            context: pending.context,
        };
        (Some(resolution), self.promote_next())
    }

    /// Resolve everything as cancelled. Used on link loss and shutdown.
    pub fn cancel_all(&mut self) -> Vec<Resolution<C>> {
        let mut resolutions = Vec::new();
        if let Some(pending) = self.in_flight.take() {
            resolutions.push(Resolution::Cancelled {
                context: pending.context,
            });
        }
        for pending in self.queue.drain(..) {
            resolutions.push(Resolution::Cancelled {
                context: pending.context,
            });
        }
        resolutions
    }

    /// Deadline of the in-flight command, for the session's timer branch.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|p| p.deadline)
    }

    #[must_use]
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Opcode of the in-flight command, if any.
    #[must_use]
    pub fn in_flight_opcode(&self) -> Option<Opcode> {
        self.in_flight.as_ref().map(|p| p.command.opcode())
    }

    fn promote_next(&mut self) -> WriteAction {
        match self.queue.pop_front() {
            Some(mut next) => {
                next.deadline = Instant::now() + self.timeout;
                let command = next.command.clone();
                trace!(seq = next.seq, opcode = ?command.opcode(), "queued command in flight");
                self.in_flight = Some(next);
                WriteAction::Send(command)
            }
            None => WriteAction::None,
        }
    }
}
