//! Fixed-interval polling of a [`Session`].
//!
//! Ticks are due every `poll_interval` measured from the previous due time, so a
//! slow tick does not shift the whole schedule. After an overrun longer than one
//! interval the schedule restarts from the current time instead of firing a backlog.

use std::thread;
use std::time::{Duration, Instant};

use log::trace;

use crate::config::LinkConfig;
use crate::session::Session;

#[derive(Debug, Clone)]
pub struct PollScheduler {
    interval: Duration,
    next_due: Option<Instant>,
}

impl PollScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_due: None,
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(config.poll_interval())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The first call is always due.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.next_due {
            Some(due) => now >= due,
            None => true,
        }
    }

    pub fn mark_ticked(&mut self, now: Instant) {
        let next = match self.next_due {
            Some(due) if now < due + self.interval => due + self.interval,
            _ => now + self.interval,
        };
        self.next_due = Some(next);
    }

    /// Time left before the next tick. Zero when due.
    pub fn until_due(&self, now: Instant) -> Duration {
        self.next_due
            .map(|due| due.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Tick `session` if due. Returns whether a tick ran.
    ///
    /// Tick errors are already reported through the session's events and state, so
    /// they are only logged here.
    pub fn poll_due(&mut self, session: &mut Session, now: Instant) -> bool {
        if !self.is_due(now) {
            return false;
        }
        if let Err(e) = session.tick_at(now) {
            trace!("Tick ended with: {e}");
        }
        self.mark_ticked(now);
        true
    }

    /// Tick `session` on schedule, sleeping in between, for as long as
    /// `keep_running` returns `true`.
    pub fn run<F>(&mut self, session: &mut Session, mut keep_running: F)
    where
        F: FnMut(&Session) -> bool,
    {
        while keep_running(session) {
            let now = Instant::now();
            if !self.poll_due(session, now) {
                thread::sleep(self.until_due(now));
            }
        }
    }
}

impl Default for PollScheduler {
    fn default() -> Self {
        Self::from_config(&LinkConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{LinkState, SessionEvent};
    use crate::transport::{ByteSource, ScriptedSource};
    use crossbeam_channel::unbounded;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn first_tick_is_due_immediately() {
        let scheduler = PollScheduler::new(30 * MS);
        let now = Instant::now();
        assert!(scheduler.is_due(now));
        assert_eq!(scheduler.until_due(now), Duration::ZERO);
    }

    #[test]
    fn ticks_follow_the_interval() {
        let mut scheduler = PollScheduler::new(30 * MS);
        let t0 = Instant::now();
        scheduler.mark_ticked(t0);
        assert!(!scheduler.is_due(t0 + 29 * MS));
        assert!(scheduler.is_due(t0 + 30 * MS));
        assert_eq!(scheduler.until_due(t0 + 10 * MS), 20 * MS);

        // a late tick keeps the cadence
        scheduler.mark_ticked(t0 + 35 * MS);
        assert!(scheduler.is_due(t0 + 60 * MS));
        assert!(!scheduler.is_due(t0 + 59 * MS));
    }

    #[test]
    fn long_overrun_restarts_schedule() {
        let mut scheduler = PollScheduler::new(30 * MS);
        let t0 = Instant::now();
        scheduler.mark_ticked(t0);
        scheduler.mark_ticked(t0 + 200 * MS);
        assert!(!scheduler.is_due(t0 + 220 * MS));
        assert!(scheduler.is_due(t0 + 230 * MS));
    }

    #[test]
    fn poll_due_drives_the_session() {
        let (tx, rx) = unbounded();
        let mut session = Session::new(LinkConfig::default(), tx);
        let source = ScriptedSource::new();
        let handle = source.clone();
        let t0 = Instant::now();
        session
            .open_with("scripted", t0, move |_| Ok(Box::new(handle) as Box<dyn ByteSource>))
            .unwrap();

        let mut scheduler = PollScheduler::from_config(session.config());
        source.deliver(b"READY\n");
        assert!(scheduler.poll_due(&mut session, t0));
        assert_eq!(session.state(), LinkState::Ready);

        assert!(!scheduler.poll_due(&mut session, t0 + 10 * MS));
        assert!(rx
            .try_iter()
            .any(|e| e == SessionEvent::StateChanged(LinkState::Ready)));
    }

    #[test]
    fn run_stops_when_asked() {
        let (tx, _rx) = unbounded();
        let mut session = Session::new(LinkConfig::default(), tx);
        let mut scheduler = PollScheduler::new(MS);
        let mut rounds = 0;
        scheduler.run(&mut session, |_| {
            rounds += 1;
            rounds <= 3
        });
        assert_eq!(rounds, 4);
    }
}
