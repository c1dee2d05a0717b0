//! One-shot timer service.
//!
//! The client owns exactly one timer slot. Arming it again supersedes
//! whatever was pending; a superseded expiry must never be delivered.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

use crate::events::{Event, TimerToken};

/// Single-slot one-shot timer.
pub trait TimerService {
    /// Claim the timer slot. Called once during client init.
    fn reserve(&mut self) -> bool;

    /// Arm the timer. Supersedes any pending expiry.
    fn start_once(&mut self, delay: Duration, token: TimerToken);

    /// Disarm without firing.
    fn stop(&mut self);

    /// An armed deadline lies in the future.
    fn is_active(&self) -> bool;

    /// The deadline passed but the expiry has not been superseded yet.
    fn is_pending(&self) -> bool;
}

/// Production timer: one detached worker thread per arming, delivering
/// the expiry into the client's event channel. Each arming bumps a
/// generation counter; a worker whose generation is stale by the time it
/// wakes simply exits, so a superseded timer never reaches the loop.
pub struct ThreadTimer {
    tx: Sender<Event>,
    generation: Arc<AtomicU64>,
    deadline: Option<Instant>,
}

impl ThreadTimer {
    pub fn new(tx: Sender<Event>) -> Self {
        Self {
            tx,
            generation: Arc::new(AtomicU64::new(0)),
            deadline: None,
        }
    }
}

impl TimerService for ThreadTimer {
    fn reserve(&mut self) -> bool {
        true
    }

    fn start_once(&mut self, delay: Duration, token: TimerToken) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.deadline = Some(Instant::now() + delay);
        let gen_handle = Arc::clone(&self.generation);
        let tx = self.tx.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            if gen_handle.load(Ordering::SeqCst) == generation {
                let _ = tx.send(Event::Timer(token));
            }
        });
    }

    fn stop(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.deadline = None;
    }

    fn is_active(&self) -> bool {
        self.deadline.is_some_and(|d| d > Instant::now())
    }

    fn is_pending(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }
}

/// Test timer: records armings, fires only when the test says so.
#[derive(Default)]
pub struct MockTimer {
    /// Currently armed (delay, token), if any.
    pub armed: Option<(Duration, TimerToken)>,
    /// Every arming since construction.
    pub history: Vec<(Duration, TimerToken)>,
    /// Set false to simulate timer-slot exhaustion at init.
    pub reserve_ok: bool,
    /// Number of `stop` calls observed.
    pub stops: usize,
}

impl MockTimer {
    pub fn new() -> Self {
        Self {
            armed: None,
            history: Vec::new(),
            reserve_ok: true,
            stops: 0,
        }
    }

    /// Take the armed token, as if the timer expired now.
    pub fn fire(&mut self) -> Option<TimerToken> {
        self.armed.take().map(|(_, token)| token)
    }
}

impl TimerService for MockTimer {
    fn reserve(&mut self) -> bool {
        self.reserve_ok
    }

    fn start_once(&mut self, delay: Duration, token: TimerToken) {
        self.armed = Some((delay, token));
        self.history.push((delay, token));
    }

    fn stop(&mut self) {
        self.armed = None;
        self.stops += 1;
    }

    fn is_active(&self) -> bool {
        self.armed.is_some()
    }

    fn is_pending(&self) -> bool {
        false
    }
}
