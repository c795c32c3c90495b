//! Progress events and cooperative cancellation.
//!
//! The driver publishes structured [`ProgressEvent`]s on crossbeam channels.
//! Consumers (console, trace file, user interfaces) drain their own receiver
//! on their own thread; a slow or vanished consumer never blocks a fit.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use ndarray::Array1;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::driver::Termination;

/// Something that happened during a fit campaign.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// An optimizer start is about to iterate.
    StartBegan { start: usize, steps: usize },

    /// An optimizer step completed.
    Step {
        start: usize,
        step: usize,
        best_nllf: f64,
        best_point: Array1<f64>,
    },

    /// The campaign-wide best improved (already checkpointed).
    Improvement {
        start: usize,
        step: usize,
        best_nllf: f64,
        best_point: Array1<f64>,
    },

    /// An optimizer start ended.
    StartFinished {
        start: usize,
        best_nllf: Option<f64>,
        termination: Termination,
    },

    /// A resynthesis repeat ended; `nllf` is `None` when it failed.
    ResynthIteration { iteration: usize, nllf: Option<f64> },

    /// The campaign ended.
    Finished {
        best_nllf: f64,
        termination: Termination,
    },
}

/// Fan-out of progress events to any number of subscribers.
#[derive(Debug, Default)]
pub struct MonitorHub {
    senders: Vec<Sender<ProgressEvent>>,
}

impl MonitorHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new consumer.
    ///
    /// The channel is unbounded: a consumer that stays alive but never
    /// drains its receiver holds every event of the campaign. Use
    /// [`MonitorHub::subscribe_bounded`] for consumers that may fall behind.
    pub fn subscribe(&mut self) -> Receiver<ProgressEvent> {
        let (tx, rx) = unbounded();
        self.senders.push(tx);
        rx
    }

    /// Register a consumer that holds at most `capacity` pending events.
    ///
    /// Events arriving while the channel is full are dropped for that
    /// consumer only.
    pub fn subscribe_bounded(&mut self, capacity: usize) -> Receiver<ProgressEvent> {
        let (tx, rx) = bounded(capacity.max(1));
        self.senders.push(tx);
        rx
    }

    /// Number of live subscribers
    pub fn subscribers(&self) -> usize {
        self.senders.len()
    }

    /// Deliver an event; subscribers whose receiver is gone are dropped.
    pub fn emit(&mut self, event: ProgressEvent) {
        if self.senders.is_empty() {
            return;
        }
        self.senders.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("progress subscriber is full; event dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

/// Shared flag checked by the driver between batches and by mappers while
/// they wait for results.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous request so the token can be reused.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Console sink: log every event through `tracing` until all senders close.
pub fn log_events(rx: Receiver<ProgressEvent>) {
    for event in rx.iter() {
        match event {
            ProgressEvent::StartBegan { start, steps } => {
                info!("start {}: {} steps", start, steps)
            }
            ProgressEvent::Step {
                step, best_nllf, ..
            } => debug!("step {} best {:.6e}", step, best_nllf),
            ProgressEvent::Improvement {
                start,
                step,
                best_nllf,
                best_point,
            } => info!(
                "start {} step {}: improved to {:.6e} at {}",
                start, step, best_nllf, best_point
            ),
            ProgressEvent::StartFinished {
                start, termination, ..
            } => info!("start {} finished: {}", start, termination),
            ProgressEvent::ResynthIteration { iteration, nllf } => match nllf {
                Some(value) => info!("resynth {} found {:.6e}", iteration, value),
                None => warn!("resynth {} failed", iteration),
            },
            ProgressEvent::Finished {
                best_nllf,
                termination,
            } => info!("fit finished ({}): best {:.6e}", termination, best_nllf),
        }
    }
}

/// Step trace sink writing `step value` lines, the `.mon` file format.
pub struct StepTrace<W: Write> {
    writer: W,
}

impl<W: Write> StepTrace<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one line for a step event; other events are skipped.
    pub fn record(&mut self, event: &ProgressEvent) -> io::Result<bool> {
        match event {
            ProgressEvent::Step {
                step, best_nllf, ..
            } => {
                writeln!(self.writer, "{} {}", step, best_nllf)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Write every step event until the channel closes; returns the number
    /// of lines written.
    pub fn drain(&mut self, rx: &Receiver<ProgressEvent>) -> io::Result<usize> {
        let mut lines = 0;
        for event in rx.iter() {
            if self.record(&event)? {
                lines += 1;
            }
        }
        self.writer.flush()?;
        Ok(lines)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn step(step: usize, value: f64) -> ProgressEvent {
        ProgressEvent::Step {
            start: 0,
            step,
            best_nllf: value,
            best_point: array![value],
        }
    }

    #[test]
    fn test_hub_drops_closed_subscribers() {
        let mut hub = MonitorHub::new();
        let kept = hub.subscribe();
        let dropped = hub.subscribe();
        drop(dropped);

        hub.emit(step(0, 1.0));
        assert_eq!(hub.subscribers(), 1);
        assert_eq!(kept.try_recv().unwrap(), step(0, 1.0));
    }

    #[test]
    fn test_bounded_subscriber_drops_overflow() {
        let mut hub = MonitorHub::new();
        let slow = hub.subscribe_bounded(2);
        let fast = hub.subscribe();
        for i in 0..5 {
            hub.emit(step(i, i as f64));
        }

        assert_eq!(hub.subscribers(), 2);
        let kept: Vec<ProgressEvent> = slow.try_iter().collect();
        assert_eq!(kept, vec![step(0, 0.0), step(1, 1.0)]);
        assert_eq!(fast.try_iter().count(), 5);

        hub.emit(step(5, 5.0));
        assert_eq!(slow.try_recv().unwrap(), step(5, 5.0));
    }

    #[test]
    fn test_step_trace_writes_only_steps() {
        let mut hub = MonitorHub::new();
        let rx = hub.subscribe();
        hub.emit(ProgressEvent::StartBegan { start: 0, steps: 2 });
        hub.emit(step(0, 2.5));
        hub.emit(step(1, 1.5));
        drop(hub);

        let mut trace = StepTrace::new(Vec::new());
        assert_eq!(trace.drain(&rx).unwrap(), 2);
        let text = String::from_utf8(trace.into_inner()).unwrap();
        assert_eq!(text, "0 2.5\n1 1.5\n");
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!clone.is_cancelled());
    }
}
