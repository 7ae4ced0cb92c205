use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

pub const CSV_HEADER: &str = "timestamp,runtime,time_delta,steps,rolling_rate,total_steps";

/// One persisted row per successful reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogRow {
    /// Wall-clock Unix time in seconds.
    pub timestamp: f64,
    /// Seconds since the tracker started.
    pub runtime: f64,
    pub time_delta: f64,
    pub steps: u64,
    pub rolling_rate: f64,
    pub total_steps: u64,
}

pub trait SampleSink: Send + 'static {
    fn append_row(&mut self, row: &LogRow) -> io::Result<()>;
}

/// CSV file named after its creation time, one per tracker run.
#[derive(Debug)]
pub struct CsvSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl CsvSink {
    /// Create `dir` if needed, open a fresh log file in it and write the
    /// header row.
    pub fn create(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("rng_log_{}.csv", unix_timestamp().as_millis()));
        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "{CSV_HEADER}")?;
        writer.flush()?;
        tracing::info!(path = %path.display(), "opened sample log");
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SampleSink for CsvSink {
    fn append_row(&mut self, row: &LogRow) -> io::Result<()> {
        writeln!(
            self.writer,
            "{},{},{},{},{},{}",
            row.timestamp,
            row.runtime,
            row.time_delta,
            row.steps,
            row.rolling_rate,
            row.total_steps
        )?;
        self.writer.flush()
    }
}

impl Drop for CsvSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to flush sample log");
        }
    }
}

/// Wall-clock time since the Unix epoch.
pub fn unix_timestamp() -> std::time::Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}
