//! Collaborator implementations for nodes without real hardware
//!
//! Tracing-backed lamps and display stand in when no peripherals are
//! attached. The memory variants record what they were given so tests can
//! inspect it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use gate_core::{DisplayOutput, GateResult, Lamps, LogSink, SignalIndicator, TimingRecord};

/// Logs lamp changes
#[derive(Debug, Default)]
pub struct TracingSignal {
    current: Option<Lamps>,
}

impl TracingSignal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SignalIndicator for TracingSignal {
    fn set_signal(&mut self, lamps: Lamps) {
        if self.current != Some(lamps) {
            tracing::info!(target: "gate::lamps", "{}", lamps);
            self.current = Some(lamps);
        }
    }
}

/// Logs display screens on one line
#[derive(Debug, Default)]
pub struct TracingDisplay;

impl DisplayOutput for TracingDisplay {
    fn show(&mut self, lines: &[String]) {
        let text = lines
            .iter()
            .filter(|l| !l.is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" | ");
        tracing::info!(target: "gate::display", "{}", text);
    }
}

/// Appends one CSV line per completed cycle
///
/// Format: `timestamp_ms,elapsed_ms,link_status,reference_distance`.
#[derive(Debug)]
pub struct CsvLogSink {
    path: PathBuf,
    file: File,
}

impl CsvLogSink {
    pub fn open(path: impl AsRef<Path>) -> GateResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::info!(path = %path.display(), "measurement log opened");
        Ok(CsvLogSink { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One CSV line without terminator
pub fn csv_line(record: &TimingRecord) -> String {
    format!(
        "{},{},{},{:.2}",
        record.timestamp_ms, record.elapsed_ms, record.link_status, record.reference_distance
    )
}

impl LogSink for CsvLogSink {
    fn append(&mut self, record: &TimingRecord) -> GateResult<()> {
        writeln!(self.file, "{}", csv_line(record))?;
        self.file.flush()?;
        Ok(())
    }
}

/// Logs each record as its CSV line
#[derive(Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn append(&mut self, record: &TimingRecord) -> GateResult<()> {
        tracing::info!(target: "gate::measurements", "{}", csv_line(record));
        Ok(())
    }
}

/// Keeps records in memory; clones share the same list
#[derive(Clone, Debug, Default)]
pub struct MemoryLogSink {
    records: Arc<Mutex<Vec<TimingRecord>>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TimingRecord> {
        self.records.lock().clone()
    }
}

impl LogSink for MemoryLogSink {
    fn append(&mut self, record: &TimingRecord) -> GateResult<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Remembers every lamp state it was given; clones share the history
#[derive(Clone, Debug, Default)]
pub struct MemorySignal {
    history: Arc<Mutex<Vec<Lamps>>>,
}

impl MemorySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<Lamps> {
        self.history.lock().clone()
    }

    pub fn current(&self) -> Option<Lamps> {
        self.history.lock().last().copied()
    }
}

impl SignalIndicator for MemorySignal {
    fn set_signal(&mut self, lamps: Lamps) {
        self.history.lock().push(lamps);
    }
}

/// Remembers every screen it was given; clones share the history
#[derive(Clone, Debug, Default)]
pub struct MemoryDisplay {
    screens: Arc<Mutex<Vec<Vec<String>>>>,
}

impl MemoryDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn screens(&self) -> Vec<Vec<String>> {
        self.screens.lock().clone()
    }

    pub fn last(&self) -> Option<Vec<String>> {
        self.screens.lock().last().cloned()
    }
}

impl DisplayOutput for MemoryDisplay {
    fn show(&mut self, lines: &[String]) {
        self.screens.lock().push(lines.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gate_core::LinkStatus;

    fn record(elapsed_ms: u64, link_status: LinkStatus) -> TimingRecord {
        TimingRecord {
            timestamp_ms: 12_345,
            elapsed_ms,
            link_status,
            reference_distance: 100.0,
        }
    }

    #[test]
    fn test_csv_line_format() {
        assert_eq!(csv_line(&record(733, LinkStatus::Ok)), "12345,733,OK,100.00");
        assert_eq!(
            csv_line(&record(0, LinkStatus::NoClient)),
            "12345,0,NO_CLIENT,100.00"
        );
    }

    #[test]
    fn test_csv_sink_appends() {
        let path = std::env::temp_dir().join(format!("gate-csv-{}.csv", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let mut sink = CsvLogSink::open(&path).unwrap();
        sink.append(&record(733, LinkStatus::Ok)).unwrap();
        drop(sink);

        // Reopening appends rather than truncating
        let mut sink = CsvLogSink::open(&path).unwrap();
        sink.append(&record(812, LinkStatus::Ok)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "12345,733,OK,100.00\n12345,812,OK,100.00\n");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_memory_sinks_share_state() {
        let log = MemoryLogSink::new();
        let mut writer = log.clone();
        writer.append(&record(733, LinkStatus::Ok)).unwrap();
        assert_eq!(log.records().len(), 1);

        let signal = MemorySignal::new();
        let mut lamps = signal.clone();
        lamps.set_signal(Lamps::GO);
        lamps.set_signal(Lamps::DARK);
        assert_eq!(signal.history(), vec![Lamps::GO, Lamps::DARK]);
        assert_eq!(signal.current(), Some(Lamps::DARK));
    }
}
