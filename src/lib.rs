//! Serial link driver for a brace stiffness test bench.
//!
//! The bench streams binary telemetry frames and newline-terminated text over one
//! serial link. This crate opens the link, waits for the `READY` handshake,
//! separates the two kinds of traffic, validates frames, and sends JSON commands
//! plus the raw emergency stop byte back to the device.
//!
//! # Wire format
//!
//! ```text
//! frame: 0xAA | time f32 LE | displacement f32 LE | force f32 LE | xor checksum
//! text:  UTF-8 bytes ... '\n'
//! ```
//!
//! A frame whose three values are all `-1.0` marks the end of a burst.
//!
//! # Usage
//!
//! Build a [`Session`] with an [`EventSink`] (a `crossbeam_channel::Sender` works),
//! open a port, and tick it every few tens of milliseconds, either by hand with
//! [`Session::tick`] or through a [`PollScheduler`]. Everything the device does is
//! reported as a [`SessionEvent`].

mod config;
mod demux;
mod errors;
mod frame;
mod logging;
mod protocol;
mod recording;
mod scheduler;
mod session;
mod transport;

pub use config::{
    LinkConfig, DEFAULT_BAUD_RATE, DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_POLL_INTERVAL_MS,
    DEFAULT_READ_TIMEOUT_MS,
};
pub use demux::{Demultiplexer, Inbound, PollReport, MAX_LINE_LEN};
pub use errors::*;
pub use frame::{
    checksum, decode_body, decode_frame, encode_end_of_burst, encode_frame, verify_checksum,
    FrameDecode, Sample, FRAME_BODY_LEN, FRAME_LEN, PAYLOAD_LEN, START_BYTE,
};
pub use logging::init_rust_logging;
pub use protocol::{
    decode_line, parse_cycle_finished, Command, Event, LineKind, TestParameters, TextLine,
    EMERGENCY_STOP_BYTE, HANDSHAKE_LINE, LINE_TERMINATOR,
};
pub use recording::{Recording, RecordingConfig, RecordingSummary, SampleFate, SampleLog};
pub use scheduler::PollScheduler;
pub use session::{
    Alert, Diagnostic, EventSink, LinkState, RunState, Session, SessionEvent,
};
pub use transport::{ByteSource, ScriptedSource, SerialSource};
