//! Splits the mixed byte stream into binary frames and text lines.
//!
//! The first byte of every unit decides what it is: [`START_BYTE`] opens a binary
//! frame, anything else opens a text line. A poll drains everything currently
//! available so a burst never backs up across ticks.
//!
//! Two outcomes end a poll early:
//! - the end-of-burst sentinel frame, and
//! - a truncated frame (fewer than 13 bytes after the start byte within the read
//!   timeout). The partial frame is dropped and nothing is kept for the next tick;
//!   the byte stream resynchronizes on its own at the next unit.
//!
//! Text lines may span ticks: bytes received before the terminator are held in a
//! text tail until the rest shows up.

use log::{debug, trace, warn};

use crate::errors::Result;
use crate::frame::{self, FrameDecode, Sample, FRAME_BODY_LEN, START_BYTE};
use crate::protocol::{self, TextLine, LINE_TERMINATOR};
use crate::transport::ByteSource;

/// Longest line kept while waiting for its terminator.
pub const MAX_LINE_LEN: usize = 4096;

/// A decoded unit, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Sample(Sample),
    Line(TextLine),
}

/// What one poll produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollReport {
    pub items: Vec<Inbound>,
    /// Frames discarded because their checksum did not match.
    pub checksum_errors: usize,
    /// Bytes received after the start byte of a frame cut short, if any.
    pub truncated: Option<usize>,
    /// The poll stopped on the end-of-burst sentinel.
    pub end_of_burst: bool,
    /// Bytes of over-long lines that were thrown away.
    pub overflowed_bytes: usize,
}

impl PollReport {
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.items.iter().filter_map(|item| match item {
            Inbound::Sample(sample) => Some(sample),
            Inbound::Line(_) => None,
        })
    }

    pub fn lines(&self) -> impl Iterator<Item = &TextLine> {
        self.items.iter().filter_map(|item| match item {
            Inbound::Line(line) => Some(line),
            Inbound::Sample(_) => None,
        })
    }
}

/// Outcome of continuing a text line.
enum LineRead {
    Complete(Vec<u8>),
    /// Terminator of an over-long line; nothing to hand on.
    Discarded,
    /// Bytes ran out before the terminator.
    Pending,
}

#[derive(Debug, Default)]
pub struct Demultiplexer {
    text_tail: Vec<u8>,
    /// Dropping the rest of an over-long line until its terminator.
    discarding: bool,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether part of a text line is waiting for its terminator.
    pub fn has_partial_line(&self) -> bool {
        !self.text_tail.is_empty() || self.discarding
    }

    /// Forget any partial line. Called when the link closes.
    pub fn reset(&mut self) {
        self.text_tail.clear();
        self.discarding = false;
    }

    /// Drain the bytes currently available from `source`.
    ///
    /// Errors are transport failures only; framing and decode problems are reported
    /// in the returned [`PollReport`].
    pub fn poll(&mut self, source: &mut dyn ByteSource) -> Result<PollReport> {
        let mut report = PollReport::default();

        while source.bytes_available()? > 0 {
            let mut head = [0u8; 1];
            if source.read_up_to(&mut head)? == 0 {
                break;
            }

            if head[0] == START_BYTE {
                if !self.text_tail.is_empty() {
                    warn!(
                        "Dropping {} bytes of unterminated text before a frame start",
                        self.text_tail.len()
                    );
                    self.text_tail.clear();
                }
                self.discarding = false;

                let mut body = [0u8; FRAME_BODY_LEN];
                let got = source.read_up_to(&mut body)?;
                if got < FRAME_BODY_LEN {
                    warn!(
                        "Truncated frame: {} of {} bytes after start byte, skipping rest of tick",
                        got, FRAME_BODY_LEN
                    );
                    report.truncated = Some(got);
                    return Ok(report);
                }

                match frame::decode_body(&body) {
                    FrameDecode::Sample(sample) => report.items.push(Inbound::Sample(sample)),
                    FrameDecode::EndOfBurst => {
                        trace!("End-of-burst sentinel");
                        report.end_of_burst = true;
                        return Ok(report);
                    }
                    FrameDecode::BadChecksum {
                        received,
                        calculated,
                    } => {
                        debug!(
                            "Frame checksum mismatch (received {:#04X}, calculated {:#04X})",
                            received, calculated
                        );
                        report.checksum_errors += 1;
                    }
                }
            } else {
                match self.read_line(head[0], source, &mut report)? {
                    LineRead::Complete(raw) => {
                        let line = protocol::decode_line(&raw);
                        if line.text.is_empty() {
                            trace!("Skipping blank line");
                        } else {
                            report.items.push(Inbound::Line(line));
                        }
                    }
                    LineRead::Discarded => {}
                    // stream ran dry mid-line; the tail carries over
                    LineRead::Pending => break,
                }
            }
        }

        if report.checksum_errors > 0 {
            warn!(
                "Checksum errors in tick: {} (suppressing per-frame logs)",
                report.checksum_errors
            );
        }
        Ok(report)
    }

    /// Continue the current text line with `first`, reading until the terminator.
    ///
    /// Once a line grows past [`MAX_LINE_LEN`] everything up to its terminator is
    /// counted as overflow and dropped.
    fn read_line(
        &mut self,
        first: u8,
        source: &mut dyn ByteSource,
        report: &mut PollReport,
    ) -> Result<LineRead> {
        let mut byte = first;
        loop {
            if byte == LINE_TERMINATOR {
                if self.discarding {
                    self.discarding = false;
                    debug!("End of over-long line");
                    return Ok(LineRead::Discarded);
                }
                return Ok(LineRead::Complete(std::mem::take(&mut self.text_tail)));
            }

            if self.discarding {
                report.overflowed_bytes += 1;
            } else {
                self.text_tail.push(byte);
                if self.text_tail.len() > MAX_LINE_LEN {
                    warn!(
                        "Line exceeds {} bytes, discarding until the next terminator",
                        MAX_LINE_LEN
                    );
                    report.overflowed_bytes += self.text_tail.len();
                    self.text_tail.clear();
                    self.discarding = true;
                }
            }

            let mut next = [0u8; 1];
            if source.read_up_to(&mut next)? == 0 {
                trace!("Holding {} bytes of partial line", self.text_tail.len());
                return Ok(LineRead::Pending);
            }
            byte = next[0];
        }
    }
}
