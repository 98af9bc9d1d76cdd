//! Threaded driver for a cooperative agent.
//!
//! The conductor owns an [`Agent`] on a spawned thread and repeatedly calls
//! `do_work` with the current epoch time, backing off through the idle
//! strategy whenever a duty cycle reports no progress. Start and stop are
//! signalled over a channel and acknowledged the same way.

use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, info};

/// A unit of cooperatively-scheduled work driven by a conductor.
pub trait Agent: Send + 'static {
    fn on_start(&mut self) {}

    /// Performs a bounded amount of work, returning the number of units
    /// processed so the conductor can back off when idle.
    fn do_work(&mut self, now_ms: i64) -> usize;

    fn on_close(&mut self) {}

    fn role_name(&self) -> &'static str;
}

pub trait IdleStrategy: Send {
    fn idle(&mut self, work_count: usize);
    fn reset(&mut self);
}

/// Spin, then yield, then park for increasing intervals.
pub struct BackoffIdle {
    spins: u32,
    yields: u32,
    max_park: Duration,
    state: u64,
}

impl BackoffIdle {
    pub fn new(spins: u32, yields: u32, max_park: Duration) -> Self {
        Self {
            spins,
            yields,
            max_park,
            state: 0,
        }
    }
}

impl Default for BackoffIdle {
    fn default() -> Self {
        Self::new(10, 10, Duration::from_millis(1))
    }
}

impl IdleStrategy for BackoffIdle {
    fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }

        self.state += 1;
        if self.state <= u64::from(self.spins) {
            std::hint::spin_loop();
        } else if self.state <= u64::from(self.spins + self.yields) {
            thread::yield_now();
        } else {
            let exponent = (self.state - u64::from(self.spins + self.yields)).min(10);
            let park = Duration::from_micros(1 << exponent).min(self.max_park);
            thread::park_timeout(park);
        }
    }

    fn reset(&mut self) {
        self.state = 0;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Signal {
    Stop,
    Stopped,
}

/// Runs an agent on its own thread until stopped or the agent's work loop
/// ends on its own.
pub struct Conductor {
    signal_tx: Sender<Signal>,
    ack_rx: Receiver<Signal>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Conductor {
    pub fn start<A: Agent>(mut agent: A, mut idle: impl IdleStrategy + 'static) -> Self {
        let (signal_tx, signal_rx) = bounded::<Signal>(1);
        let (ack_tx, ack_rx) = bounded::<Signal>(1);

        let handle = thread::spawn(move || {
            info!("{}: starting", agent.role_name());
            agent.on_start();

            loop {
                if let Ok(Signal::Stop) = signal_rx.try_recv() {
                    break;
                }
                let work_count = agent.do_work(epoch_ms());
                idle.idle(work_count);
            }

            agent.on_close();
            info!("{}: stopped", agent.role_name());
            let _ = ack_tx.send(Signal::Stopped);
        });

        Self {
            signal_tx,
            ack_rx,
            handle: Some(handle),
        }
    }

    /// Signals the agent to stop and waits for the thread to acknowledge.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        if self.handle.is_none() {
            return true;
        }
        let _ = self.signal_tx.send(Signal::Stop);
        if let Some(handle) = self.handle.as_ref() {
            handle.thread().unpark();
        }

        match self.ack_rx.recv_timeout(timeout) {
            Ok(Signal::Stopped) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                true
            }
            _ => {
                error!("agent did not acknowledge stop within {:?}", timeout);
                false
            }
        }
    }
}

impl Drop for Conductor {
    fn drop(&mut self) {
        let _ = self.stop(Duration::from_secs(5));
    }
}

pub fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingAgent {
        ticks: Arc<AtomicUsize>,
    }

    impl Agent for CountingAgent {
        fn do_work(&mut self, _now_ms: i64) -> usize {
            self.ticks.fetch_add(1, Ordering::Relaxed);
            1
        }

        fn role_name(&self) -> &'static str {
            "counting-agent"
        }
    }

    #[test]
    fn runs_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut conductor = Conductor::start(
            CountingAgent {
                ticks: Arc::clone(&ticks),
            },
            BackoffIdle::default(),
        );

        while ticks.load(Ordering::Relaxed) < 10 {
            thread::yield_now();
        }
        assert!(conductor.stop(Duration::from_secs(5)));
    }
}
