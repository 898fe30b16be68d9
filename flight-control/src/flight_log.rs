//! Per-session CSV flight log.
//!
//! The control thread hands one [`FlightRecord`] per armed tick to a writer
//! thread through a bounded queue. When the queue is full the record is
//! dropped and counted, so a slow disk never stretches a tick.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Local;
use crossbeam_channel::{bounded, Sender, TrySendError};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::estimate::StateEstimate;
use crate::setpoint::{ControlOutput, Reference};

/// Default queue depth, about two seconds at 50 Hz.
pub const DEFAULT_QUEUE_DEPTH: usize = 100;

/// Errors from the flight log writer.
#[derive(Error, Debug)]
pub enum FlightLogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The writer thread panicked.
    #[error("Flight log writer thread panicked")]
    WriterPanicked,
}

/// Number of columns per row.
const COLUMNS: usize = 34;

const HEADER: [&str; COLUMNS] = [
    "t", "roll_cmd", "pitch_cmd", "yawrate_cmd", "thrust_cmd", "ref_x", "ref_y", "ref_z",
    "ref_yaw", "x", "y", "z", "vx", "vy", "vz", "qx", "qy", "qz", "qw", "r11", "r12", "r13",
    "r21", "r22", "r23", "r31", "r32", "r33", "roll", "pitch", "yaw", "stab_roll",
    "stab_pitch", "stab_yaw",
];

/// One armed tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlightRecord {
    /// Seconds since the loop started ticking
    pub t: f64,
    pub setpoint: ControlOutput,
    pub reference: Reference,
    pub estimate: StateEstimate,
}

impl FlightRecord {
    fn fields(&self) -> [f64; COLUMNS] {
        let sp = &self.setpoint;
        let r = &self.reference;
        let e = &self.estimate;
        let q = e.attitude.quaternion();
        let m = e.rotation();
        let (roll, pitch, yaw) = e.euler();

        [
            self.t,
            sp.roll,
            sp.pitch,
            sp.yaw_rate,
            f64::from(sp.thrust),
            r.position.x,
            r.position.y,
            r.position.z,
            r.yaw,
            e.position.x,
            e.position.y,
            e.position.z,
            e.velocity.x,
            e.velocity.y,
            e.velocity.z,
            q.i,
            q.j,
            q.k,
            q.w,
            m[(0, 0)],
            m[(0, 1)],
            m[(0, 2)],
            m[(1, 0)],
            m[(1, 1)],
            m[(1, 2)],
            m[(2, 0)],
            m[(2, 1)],
            m[(2, 2)],
            roll,
            pitch,
            yaw,
            e.stabilizer.x,
            e.stabilizer.y,
            e.stabilizer.z,
        ]
    }
}

/// File name for a log started now: `flightlog_YYYYmmdd_HHMMSS.csv`.
pub fn session_file_name() -> String {
    format!("flightlog_{}.csv", Local::now().format("%Y%m%d_%H%M%S"))
}

/// Summary returned when a log is closed.
#[derive(Debug, Clone, PartialEq)]
pub struct FlightLogSummary {
    pub path: PathBuf,
    pub written: u64,
    pub dropped: u64,
}

/// Handle to an open flight log.
pub struct FlightLog {
    path: PathBuf,
    sender: Option<Sender<FlightRecord>>,
    writer: Option<JoinHandle<Result<u64, FlightLogError>>>,
    dropped: Arc<AtomicU64>,
}

impl FlightLog {
    /// Create a log in `dir` named after the current local time.
    pub fn create_in(dir: &Path) -> Result<Self, FlightLogError> {
        Self::create(&dir.join(session_file_name()), DEFAULT_QUEUE_DEPTH)
    }

    /// Create a log at `path`, truncating an existing file.
    pub fn create(path: &Path, queue_depth: usize) -> Result<Self, FlightLogError> {
        let file = File::create(path)?;
        let mut csv_writer = csv::Writer::from_writer(BufWriter::new(file));
        csv_writer.write_record(HEADER)?;
        csv_writer.flush()?;

        let (sender, receiver) = bounded::<FlightRecord>(queue_depth.max(1));
        let writer = thread::Builder::new()
            .name("flight-log".into())
            .spawn(move || -> Result<u64, FlightLogError> {
                let mut written = 0u64;
                for record in receiver {
                    let fields = record.fields();
                    csv_writer.write_record(fields.iter().map(|v| v.to_string()))?;
                    // Rows must survive a crash of the ground station
                    csv_writer.flush()?;
                    written += 1;
                }
                csv_writer.flush()?;
                csv_writer
                    .into_inner()
                    .map_err(|e| FlightLogError::Io(e.into_error()))?
                    .flush()?;
                Ok(written)
            })?;

        info!("Flight log: {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            sender: Some(sender),
            writer: Some(writer),
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a record without blocking. Returns false if it was dropped.
    pub fn record(&self, record: FlightRecord) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };
        match sender.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                // Writer died; its error surfaces on close
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Records dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flush everything queued and close the file.
    pub fn close(mut self) -> Result<FlightLogSummary, FlightLogError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<FlightLogSummary, FlightLogError> {
        self.sender.take();
        let written = match self.writer.take() {
            Some(handle) => handle.join().map_err(|_| FlightLogError::WriterPanicked)??,
            None => 0,
        };
        let summary = FlightLogSummary {
            path: self.path.clone(),
            written,
            dropped: self.dropped(),
        };
        if summary.dropped > 0 {
            warn!(
                "Flight log {} dropped {} of {} records",
                summary.path.display(),
                summary.dropped,
                summary.dropped + summary.written
            );
        }
        Ok(summary)
    }
}

impl Drop for FlightLog {
    fn drop(&mut self) {
        if self.writer.is_some() {
            if let Err(e) = self.shutdown() {
                error!("Failed to close flight log: {e}");
            }
        }
    }
}

impl std::fmt::Debug for FlightLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlightLog")
            .field("path", &self.path)
            .field("dropped", &self.dropped())
            .finish()
    }
}
