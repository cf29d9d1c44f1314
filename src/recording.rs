//! Per-test recording: sample buffer, preparation-cycle policy and raw sample log.
//!
//! The bench may run one warm-up cycle before the measured ones. With
//! `skip_preparation` set, samples are discarded until the device reports
//! `Cycle finished: 1`; the buffer is then cleared once and recording starts for real.
//! With `align_on_time_zero` also set, samples after that boundary are still dropped
//! until one whose time rounds to 0.00 s marks the start of the next motion.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, error, info};
use serde::Serialize;

use crate::errors::{DriverError, Result};
use crate::frame::Sample;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingConfig {
    pub skip_preparation: bool,
    pub align_on_time_zero: bool,
    /// Measured cycles expected, for progress reporting.
    pub total_cycles: Option<u32>,
    /// Where to write the raw sample log, opened when the device reports `START`.
    pub log_path: Option<PathBuf>,
}

/// What happened to a sample offered to the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFate {
    Kept,
    /// Dropped during the preparation cycle. `first` is set for the first such sample.
    Preparation { first: bool },
    /// Dropped while waiting for the motion to restart at t = 0.
    AwaitingTimeZero,
}

/// Handed to persistence collaborators when a recording ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingSummary {
    /// Measured cycles, preparation cycle excluded.
    pub cycles_completed: u32,
    pub samples_kept: usize,
    pub samples_skipped: usize,
    pub aborted: bool,
    pub log_path: Option<PathBuf>,
}

/// Tab-separated `time displacement force` log, two decimals per value.
pub struct SampleLog {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl SampleLog {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        info!("Recording samples to {}", path.display());
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_sample(&mut self, sample: &Sample) -> Result<()> {
        writeln!(
            self.writer,
            "{:.2}\t{:.2}\t{:.2}",
            sample.time, sample.displacement, sample.force
        )?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<PathBuf> {
        self.writer.flush()?;
        Ok(self.path)
    }

    /// Load a log written by [`SampleLog`] (or any whitespace-separated triple file).
    pub fn read(path: impl AsRef<Path>) -> Result<Vec<Sample>> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut samples = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let values: Vec<f32> = line
                .split_whitespace()
                .map(str::parse::<f32>)
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| {
                    DriverError::Protocol(format!("sample log line {}: {e}", index + 1))
                })?;
            match values[..] {
                [time, displacement, force] => {
                    samples.push(Sample::new(time, displacement, force))
                }
                _ => {
                    return Err(DriverError::Protocol(format!(
                        "sample log line {}: expected 3 values, found {}",
                        index + 1,
                        values.len()
                    )))
                }
            }
        }
        Ok(samples)
    }
}

pub struct Recording {
    config: RecordingConfig,
    samples: Vec<Sample>,
    skipping: bool,
    waiting_for_time_zero: bool,
    device_cycles: u32,
    skipped: usize,
    log: Option<SampleLog>,
    log_error: Option<String>,
}

impl Recording {
    pub fn new(config: RecordingConfig) -> Self {
        let skipping = config.skip_preparation;
        Self {
            config,
            samples: Vec::new(),
            skipping,
            waiting_for_time_zero: false,
            device_cycles: 0,
            skipped: 0,
            log: None,
            log_error: None,
        }
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.config
    }

    /// Device reported `START`: reset buffer and counter, open the log if configured.
    pub fn begin(&mut self) -> Result<()> {
        self.samples.clear();
        self.device_cycles = 0;
        if self.log.is_none() {
            if let Some(path) = self.config.log_path.clone() {
                self.log = Some(SampleLog::create(path)?);
            }
        }
        Ok(())
    }

    pub fn accept(&mut self, sample: Sample) -> SampleFate {
        if self.skipping {
            self.skipped += 1;
            return SampleFate::Preparation {
                first: self.skipped == 1,
            };
        }

        if self.waiting_for_time_zero {
            if (sample.time * 100.0).round() == 0.0 {
                self.waiting_for_time_zero = false;
            } else {
                self.skipped += 1;
                return SampleFate::AwaitingTimeZero;
            }
        }

        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.write_sample(&sample) {
                error!("Sample log write failed, logging disabled: {e}");
                self.log_error = Some(e.to_string());
                self.log = None;
            }
        }
        self.samples.push(sample);
        SampleFate::Kept
    }

    /// Record the device's cycle count. Returns `true` when this ends the
    /// preparation cycle.
    pub fn on_cycle_finished(&mut self, count: u32) -> bool {
        self.device_cycles = count;
        if self.skipping && count >= 1 {
            debug!(
                "Preparation cycle done, clearing {} buffered samples",
                self.samples.len()
            );
            self.skipping = false;
            self.samples.clear();
            self.waiting_for_time_zero = self.config.align_on_time_zero;
            return true;
        }
        false
    }

    pub fn is_in_preparation(&self) -> bool {
        self.skipping
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Measured cycles completed so far.
    pub fn cycles_completed(&self) -> u32 {
        let offset = u32::from(self.config.skip_preparation);
        self.device_cycles.saturating_sub(offset)
    }

    pub fn total_cycles(&self) -> Option<u32> {
        self.config.total_cycles
    }

    /// A log write failure not yet reported.
    pub fn take_log_error(&mut self) -> Option<String> {
        self.log_error.take()
    }

    pub fn finish(self, aborted: bool) -> RecordingSummary {
        let cycles_completed = self.cycles_completed();
        let log_path = match self.log {
            Some(log) => {
                let path = log.path().to_path_buf();
                if let Err(e) = log.finish() {
                    error!("Could not flush sample log {}: {e}", path.display());
                }
                Some(path)
            }
            None => None,
        };
        RecordingSummary {
            cycles_completed,
            samples_kept: self.samples.len(),
            samples_skipped: self.skipped,
            aborted,
            log_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(t: f32) -> Sample {
        Sample::new(t, t * 2.0, t * 3.0)
    }

    #[test]
    fn keeps_everything_without_preparation() {
        let mut rec = Recording::new(RecordingConfig::default());
        assert_eq!(rec.accept(sample(0.0)), SampleFate::Kept);
        assert_eq!(rec.accept(sample(0.1)), SampleFate::Kept);
        assert!(!rec.on_cycle_finished(1));
        assert_eq!(rec.samples().len(), 2);
        assert_eq!(rec.cycles_completed(), 1);
    }

    #[test]
    fn preparation_samples_are_dropped_until_first_cycle() {
        let mut rec = Recording::new(RecordingConfig {
            skip_preparation: true,
            ..Default::default()
        });
        assert_eq!(rec.accept(sample(0.0)), SampleFate::Preparation { first: true });
        assert_eq!(rec.accept(sample(0.1)), SampleFate::Preparation { first: false });
        assert!(rec.samples().is_empty());

        assert!(rec.on_cycle_finished(1));
        assert!(!rec.is_in_preparation());
        assert_eq!(rec.accept(sample(0.2)), SampleFate::Kept);
        assert!(!rec.on_cycle_finished(2));
        assert_eq!(rec.samples(), &[sample(0.2)]);
        assert_eq!(rec.cycles_completed(), 1);
    }

    #[test]
    fn time_zero_alignment_waits_for_restart() {
        let mut rec = Recording::new(RecordingConfig {
            skip_preparation: true,
            align_on_time_zero: true,
            ..Default::default()
        });
        rec.accept(sample(3.0));
        rec.on_cycle_finished(1);
        assert_eq!(rec.accept(sample(3.1)), SampleFate::AwaitingTimeZero);
        assert_eq!(rec.accept(sample(0.004)), SampleFate::Kept);
        assert_eq!(rec.accept(sample(0.5)), SampleFate::Kept);
        assert_eq!(rec.samples().len(), 2);
    }

    #[test]
    fn log_file_round_trips_two_decimals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench_raw.txt");
        let mut rec = Recording::new(RecordingConfig {
            log_path: Some(path.clone()),
            ..Default::default()
        });
        rec.begin().unwrap();
        rec.accept(Sample::new(0.0, 0.0, 0.0));
        rec.accept(Sample::new(0.1, 2.0, 5.004));

        let summary = rec.finish(false);
        assert_eq!(summary.log_path.as_deref(), Some(path.as_path()));
        assert_eq!(summary.samples_kept, 2);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "0.00\t0.00\t0.00\n0.10\t2.00\t5.00\n");
        let loaded = SampleLog::read(&path).unwrap();
        assert_eq!(loaded, vec![Sample::new(0.0, 0.0, 0.0), Sample::new(0.1, 2.0, 5.0)]);
    }

    #[test]
    fn begin_fails_on_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = Recording::new(RecordingConfig {
            log_path: Some(dir.path().join("missing").join("raw.txt")),
            ..Default::default()
        });
        assert!(rec.begin().is_err());
    }

    #[test]
    fn malformed_log_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.txt");
        std::fs::write(&path, "0.0\t1.0\t2.0\n0.1\t1.1\n").unwrap();
        let err = SampleLog::read(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn aborted_summary_counts_skipped() {
        let mut rec = Recording::new(RecordingConfig {
            skip_preparation: true,
            total_cycles: Some(5),
            ..Default::default()
        });
        rec.accept(sample(0.0));
        rec.accept(sample(0.1));
        let summary = rec.finish(true);
        assert!(summary.aborted);
        assert_eq!(summary.samples_skipped, 2);
        assert_eq!(summary.cycles_completed, 0);
    }
}
