//! Connection lifecycle and event routing.
//!
//! A [`Session`] owns the one open link to the bench. It runs the `READY` handshake,
//! turns decoded units into [`SessionEvent`]s for observers, follows the device's
//! `START`/`END`/`IDLE`/`EMERGENCY_STOP` events, and keeps the recording of the
//! current test.
//!
//! ```text
//! Closed -> OpeningLink -> AwaitingHandshake -> Ready
//!    ^           |                |              |
//!    +-----------+----------------+--------------+   open failure, handshake
//!                                                    timeout, transport error, close
//! ```
//!
//! Everything runs on the caller's thread. Embedding the session in a multi-threaded
//! program requires putting it behind a mutex so sends and polls stay serialized.

use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde_json::{Map, Value};

use crate::config::LinkConfig;
use crate::demux::{Demultiplexer, Inbound, PollReport};
use crate::errors::{DriverError, Result};
use crate::frame::Sample;
use crate::protocol::{Command, Event, LineKind, TestParameters, TextLine, EMERGENCY_STOP_BYTE};
use crate::recording::{Recording, RecordingConfig, RecordingSummary, SampleFate};
use crate::transport::{ByteSource, SerialSource};

// ============================================================================
// States and events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    OpeningLink,
    AwaitingHandshake,
    Ready,
}

/// Application state once the handshake is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    /// Start command sent, device has not reported `START` yet.
    Armed,
    Recording,
    /// Latched by the device's `EMERGENCY_STOP` until the operator acknowledges with
    /// the raw stop byte or the device reports `IDLE`/`END`.
    EmergencyStopped,
}

/// Conditions the user must be told about.
#[derive(Debug, Clone, PartialEq)]
pub enum Alert {
    OpenFailed { port: String, reason: String },
    HandshakeTimeout { waited: Duration },
    TransportLost(String),
    EmergencyStop,
    SampleLog(String),
}

/// Recoverable stream problems, for debugging only.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    TruncatedFrame { received: usize },
    ChecksumMismatch { frames: usize },
    MalformedJson { line: String, error: String },
    BadCycleCount { line: String },
    LineOverflow { bytes: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(LinkState),
    RunStateChanged(RunState),
    Sample(Sample),
    /// Every non-blank text line, as received.
    Line(String),
    /// A line that parsed as a JSON object.
    Message(Map<String, Value>),
    Event(Event),
    CycleFinished { count: u32, total: Option<u32> },
    PreparationStarted,
    PreparationFinished,
    RecordingStarted,
    RecordingFinished(RecordingSummary),
    CommandSent(String),
    RawSent(Vec<u8>),
    Alert(Alert),
    Diagnostic(Diagnostic),
}

/// Receiver of everything the session reports.
pub trait EventSink {
    fn emit(&mut self, event: SessionEvent);
}

impl EventSink for crossbeam_channel::Sender<SessionEvent> {
    fn emit(&mut self, event: SessionEvent) {
        // a dropped receiver just means nobody is listening any more
        let _ = self.send(event);
    }
}

// ============================================================================
// Session
// ============================================================================

struct Link {
    source: Box<dyn ByteSource>,
    demux: Demultiplexer,
    label: String,
}

pub struct Session {
    config: LinkConfig,
    sink: Box<dyn EventSink>,
    state: LinkState,
    run: RunState,
    link: Option<Link>,
    handshake_deadline: Option<Instant>,
    recording: Option<Recording>,
}

impl Session {
    pub fn new(config: LinkConfig, sink: impl EventSink + 'static) -> Self {
        Self {
            config,
            sink: Box::new(sink),
            state: LinkState::Closed,
            run: RunState::Idle,
            link: None,
            handshake_deadline: None,
            recording: None,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn run_state(&self) -> RunState {
        self.run
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Name of the open link, e.g. the serial port path.
    pub fn link_label(&self) -> Option<&str> {
        self.link.as_ref().map(|l| l.label.as_str())
    }

    pub fn recording(&self) -> Option<&Recording> {
        self.recording.as_ref()
    }

    /// Time left for the device to answer `READY`.
    pub fn handshake_remaining(&self, now: Instant) -> Option<Duration> {
        self.handshake_deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    /// Open a serial port and start waiting for the handshake.
    pub fn open(&mut self, port: &str) -> Result<()> {
        self.open_with(port, Instant::now(), |config| {
            Ok(Box::new(SerialSource::open(port, config)?) as Box<dyn ByteSource>)
        })
    }

    /// Open a link through `opener`. Any link already open is closed first.
    pub fn open_with<F>(&mut self, label: &str, now: Instant, opener: F) -> Result<()>
    where
        F: FnOnce(&LinkConfig) -> Result<Box<dyn ByteSource>>,
    {
        if self.link.is_some() {
            info!("Closing {} before reopening", self.link_label().unwrap_or("link"));
            self.teardown();
        }

        self.set_state(LinkState::OpeningLink);
        match opener(&self.config) {
            Ok(source) => {
                self.link = Some(Link {
                    source,
                    demux: Demultiplexer::new(),
                    label: label.to_string(),
                });
                self.handshake_deadline = Some(now + self.config.handshake_timeout());
                info!(
                    "Opened {label}, waiting {} ms for {}",
                    self.config.handshake_timeout_ms,
                    crate::protocol::HANDSHAKE_LINE
                );
                self.set_state(LinkState::AwaitingHandshake);
                Ok(())
            }
            Err(e) => {
                error!("Unable to open {label}: {e}");
                self.set_state(LinkState::Closed);
                self.emit(SessionEvent::Alert(Alert::OpenFailed {
                    port: label.to_string(),
                    reason: e.to_string(),
                }));
                Err(e)
            }
        }
    }

    /// Release the link. Harmless when nothing is open.
    pub fn close(&mut self) {
        if self.link.is_none() && self.state == LinkState::Closed {
            return;
        }
        info!("Closing {}", self.link_label().unwrap_or("link"));
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.demux.reset();
        }
        self.handshake_deadline = None;
        if self.recording.is_some() {
            self.end_recording(true);
        }
        self.set_run(RunState::Idle);
        self.set_state(LinkState::Closed);
    }

    fn fail_transport(&mut self, err: &DriverError) {
        error!("Link lost: {err}");
        self.teardown();
        self.emit(SessionEvent::Alert(Alert::TransportLost(err.to_string())));
    }

    // ------------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------------

    pub fn tick(&mut self) -> Result<()> {
        self.tick_at(Instant::now())
    }

    /// One polling tick at time `now`.
    ///
    /// Does nothing while closed. Errors are also reflected in the state and the
    /// emitted alerts; a returned error means the link was closed.
    pub fn tick_at(&mut self, now: Instant) -> Result<()> {
        if self.link.is_none() {
            return Ok(());
        }

        if self.state == LinkState::AwaitingHandshake {
            if let Some(deadline) = self.handshake_deadline {
                if now >= deadline {
                    return Err(self.handshake_timed_out());
                }
            }
        }

        let polled = match self.link.as_mut() {
            Some(link) => link.demux.poll(link.source.as_mut()),
            None => return Ok(()),
        };
        match polled {
            Ok(report) => {
                self.dispatch(report);
                Ok(())
            }
            Err(e) => {
                self.fail_transport(&e);
                Err(e)
            }
        }
    }

    fn handshake_timed_out(&mut self) -> DriverError {
        let waited = self.config.handshake_timeout();
        warn!("No {} within {} ms", crate::protocol::HANDSHAKE_LINE, waited.as_millis());
        self.teardown();
        self.emit(SessionEvent::Alert(Alert::HandshakeTimeout { waited }));
        DriverError::Timeout(format!(
            "no READY response within {} ms",
            waited.as_millis()
        ))
    }

    fn dispatch(&mut self, report: PollReport) {
        if report.checksum_errors > 0 {
            self.emit(SessionEvent::Diagnostic(Diagnostic::ChecksumMismatch {
                frames: report.checksum_errors,
            }));
        }
        if report.overflowed_bytes > 0 {
            self.emit(SessionEvent::Diagnostic(Diagnostic::LineOverflow {
                bytes: report.overflowed_bytes,
            }));
        }

        for item in report.items {
            match item {
                Inbound::Sample(sample) => self.on_sample(sample),
                Inbound::Line(line) => self.on_line(line),
            }
            if self.link.is_none() {
                return;
            }
        }

        if let Some(received) = report.truncated {
            self.emit(SessionEvent::Diagnostic(Diagnostic::TruncatedFrame {
                received,
            }));
        }
    }

    fn on_sample(&mut self, sample: Sample) {
        let recording = match (self.run, self.recording.as_mut()) {
            (RunState::Armed | RunState::Recording, Some(recording)) => recording,
            _ => {
                self.emit(SessionEvent::Sample(sample));
                return;
            }
        };

        let fate = recording.accept(sample);
        let log_error = recording.take_log_error();
        match fate {
            SampleFate::Kept => self.emit(SessionEvent::Sample(sample)),
            SampleFate::Preparation { first: true } => {
                self.emit(SessionEvent::PreparationStarted)
            }
            SampleFate::Preparation { first: false } | SampleFate::AwaitingTimeZero => {}
        }
        if let Some(reason) = log_error {
            self.emit(SessionEvent::Alert(Alert::SampleLog(reason)));
        }
    }

    fn on_line(&mut self, line: TextLine) {
        debug!("<- {}", line.text);
        self.emit(SessionEvent::Line(line.text.clone()));

        if line.is_handshake() && self.state == LinkState::AwaitingHandshake {
            info!("Bench ready");
            self.handshake_deadline = None;
            self.set_state(LinkState::Ready);
            return;
        }

        if let Some(parsed) = line.cycle_finished() {
            match parsed {
                Ok(count) => self.on_cycle_finished(count),
                Err(e) => {
                    warn!("Could not parse cycle count from {:?}: {e}", line.text);
                    self.emit(SessionEvent::Diagnostic(Diagnostic::BadCycleCount {
                        line: line.text.clone(),
                    }));
                }
            }
            return;
        }

        let event = line.event();
        match line.kind {
            LineKind::Json(map) => {
                self.emit(SessionEvent::Message(map));
                if let Some(event) = event {
                    self.emit(SessionEvent::Event(event.clone()));
                    self.on_event(event);
                }
            }
            LineKind::MalformedJson(error) => {
                warn!("Discarding malformed JSON line {:?}: {error}", line.text);
                self.emit(SessionEvent::Diagnostic(Diagnostic::MalformedJson {
                    line: line.text,
                    error,
                }));
            }
            LineKind::Plain => {}
        }
    }

    fn on_cycle_finished(&mut self, count: u32) {
        let mut total = None;
        let mut boundary = false;
        if let Some(recording) = self.recording.as_mut() {
            boundary = recording.on_cycle_finished(count);
            total = recording.total_cycles();
        }
        debug!("Cycle {count} finished");
        self.emit(SessionEvent::CycleFinished { count, total });
        if boundary {
            info!("Preparation cycle complete, recording measured cycles");
            self.emit(SessionEvent::PreparationFinished);
        }
    }

    fn on_event(&mut self, event: Event) {
        if self.state != LinkState::Ready {
            debug!("Ignoring {event} before handshake");
            return;
        }

        match event {
            Event::Start if self.run == RunState::EmergencyStopped => {
                warn!("Ignoring START while the emergency stop is latched");
            }
            Event::Start => self.begin_recording(),
            Event::End | Event::Idle => {
                if self.recording.is_some() {
                    self.end_recording(false);
                }
                self.set_run(RunState::Idle);
            }
            Event::EmergencyStop => {
                warn!("Emergency stop reported by the bench");
                if self.recording.is_some() {
                    self.end_recording(true);
                }
                self.set_run(RunState::EmergencyStopped);
                self.emit(SessionEvent::Alert(Alert::EmergencyStop));
            }
            Event::Ready | Event::Read | Event::Other(_) => {}
        }
    }

    // ------------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------------

    fn begin_recording(&mut self) {
        let mut recording = self
            .recording
            .take()
            .unwrap_or_else(|| Recording::new(RecordingConfig::default()));
        if let Err(e) = recording.begin() {
            error!("Unable to create sample log: {e}");
            self.emit(SessionEvent::Alert(Alert::SampleLog(e.to_string())));
        }
        self.recording = Some(recording);
        self.set_run(RunState::Recording);
        self.emit(SessionEvent::RecordingStarted);
    }

    fn end_recording(&mut self, aborted: bool) {
        if let Some(recording) = self.recording.take() {
            let summary = recording.finish(aborted);
            info!(
                "Recording {}: {} cycles, {} samples",
                if aborted { "aborted" } else { "finished" },
                summary.cycles_completed,
                summary.samples_kept
            );
            self.emit(SessionEvent::RecordingFinished(summary));
        }
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Send a JSON command. Requires a completed handshake and no latched emergency stop.
    pub fn send(&mut self, command: &Command) -> Result<()> {
        if self.run == RunState::EmergencyStopped {
            return Err(DriverError::EmergencyStopLatched);
        }
        if self.state != LinkState::Ready {
            return Err(DriverError::NotReady(format!(
                "cannot send {} while {:?}",
                command.name().unwrap_or("command"),
                self.state
            )));
        }

        let bytes = command.encode()?;
        self.write(&bytes)?;
        let text = String::from_utf8_lossy(&bytes).trim_end().to_string();
        debug!("-> {text}");
        self.emit(SessionEvent::CommandSent(text));
        Ok(())
    }

    /// Send the start command and arm a recording for the test.
    pub fn start_test(&mut self, params: &TestParameters, recording: RecordingConfig) -> Result<()> {
        if matches!(self.run, RunState::Armed | RunState::Recording) {
            return Err(DriverError::Protocol("a test is already running".into()));
        }
        let command = Command::start(params, recording.skip_preparation);
        self.send(&command)?;

        let recording = RecordingConfig {
            total_cycles: recording.total_cycles.or(Some(params.cycles)),
            ..recording
        };
        self.recording = Some(Recording::new(recording));
        self.set_run(RunState::Armed);
        Ok(())
    }

    /// Write the raw stop byte. Works in any open state; acknowledges a latched
    /// emergency stop.
    pub fn emergency_stop(&mut self) -> Result<()> {
        if self.link.is_none() {
            return Err(DriverError::NotReady("no link open".into()));
        }
        self.write(&[EMERGENCY_STOP_BYTE])?;
        warn!("Emergency stop sent");
        self.emit(SessionEvent::RawSent(vec![EMERGENCY_STOP_BYTE]));
        if self.run == RunState::EmergencyStopped {
            self.set_run(RunState::Idle);
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let written = match self.link.as_mut() {
            Some(link) => link.source.write_all(bytes),
            None => return Err(DriverError::NotReady("no link open".into())),
        };
        if let Err(e) = written {
            if e.is_transport() {
                self.fail_transport(&e);
            }
            return Err(e);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn set_state(&mut self, state: LinkState) {
        if self.state != state {
            debug!("Link state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn set_run(&mut self, run: RunState) {
        if self.run != run {
            debug!("Run state {:?} -> {:?}", self.run, run);
            self.run = run;
            self.emit(SessionEvent::RunStateChanged(run));
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        self.sink.emit(event);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.recording.is_some() {
            self.end_recording(true);
        }
    }
}
