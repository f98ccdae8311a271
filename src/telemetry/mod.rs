//! # Telemetry Module
//!
//! Records UPS snapshots to JSONL files with rotation.
//!
//! This module handles:
//! - Formatting each successful poll as one JSON line
//! - Starting a new file after a fixed number of records
//! - Retaining only the newest files

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::riello::protocol::{ProtocolFamily, TelemetrySnapshot};

const FILE_PREFIX: &str = "ups_";
const FILE_EXTENSION: &str = "jsonl";

#[derive(Serialize)]
struct TelemetryRecord<'a> {
    timestamp: String,
    family: ProtocolFamily,
    status: String,
    #[serde(flatten)]
    snapshot: &'a TelemetrySnapshot,
}

/// Rotating JSONL writer
pub struct TelemetryRecorder {
    dir: PathBuf,
    max_records_per_file: usize,
    max_files_to_keep: usize,
    writer: Option<BufWriter<File>>,
    current_path: Option<PathBuf>,
    records_in_file: usize,
    sequence: u32,
}

impl std::fmt::Debug for TelemetryRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryRecorder")
            .field("dir", &self.dir)
            .field("current_path", &self.current_path)
            .field("records_in_file", &self.records_in_file)
            .finish_non_exhaustive()
    }
}

impl TelemetryRecorder {
    /// Create the recorder, creating `dir` if needed
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn new<P: AsRef<Path>>(
        dir: P,
        max_records_per_file: usize,
        max_files_to_keep: usize,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!("Telemetry recording to {}", dir.display());

        Ok(Self {
            dir,
            max_records_per_file: max_records_per_file.max(1),
            max_files_to_keep: max_files_to_keep.max(1),
            writer: None,
            current_path: None,
            records_in_file: 0,
            sequence: 0,
        })
    }

    /// File currently written to
    pub fn current_path(&self) -> Option<&Path> {
        self.current_path.as_deref()
    }

    /// Append one snapshot
    ///
    /// # Errors
    ///
    /// Returns I/O or serialization errors; the recorder stays usable.
    pub fn record(&mut self, family: ProtocolFamily, snapshot: &TelemetrySnapshot) -> Result<()> {
        if self.writer.is_none() || self.records_in_file >= self.max_records_per_file {
            self.rotate()?;
        }

        let record = TelemetryRecord {
            timestamp: Local::now().to_rfc3339(),
            family,
            status: snapshot.status_flags().tokens().join(" "),
            snapshot,
        };
        let line = serde_json::to_string(&record)?;

        if let Some(writer) = self.writer.as_mut() {
            writeln!(writer, "{}", line)?;
            writer.flush()?;
        }
        self.records_in_file += 1;
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }

        self.sequence += 1;
        let name = format!(
            "{}{}_{:04}.{}",
            FILE_PREFIX,
            Local::now().format("%Y%m%d_%H%M%S"),
            self.sequence,
            FILE_EXTENSION
        );
        let path = self.dir.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Telemetry file {}", path.display());

        self.writer = Some(BufWriter::new(file));
        self.current_path = Some(path);
        self.records_in_file = 0;

        self.prune()
    }

    /// Delete the oldest telemetry files beyond the retention limit
    fn prune(&self) -> Result<()> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_telemetry_file(path))
            .collect();

        if files.len() <= self.max_files_to_keep {
            return Ok(());
        }

        files.sort();
        let excess = files.len() - self.max_files_to_keep;
        for path in files.into_iter().take(excess) {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
        Ok(())
    }
}

fn is_telemetry_file(path: &Path) -> bool {
    let name_ok = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(FILE_PREFIX))
        .unwrap_or(false);
    let ext_ok = path.extension().and_then(|e| e.to_str()) == Some(FILE_EXTENSION);
    name_ok && ext_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn snapshot() -> TelemetrySnapshot {
        TelemetrySnapshot {
            status_code: [0x08, 0, 0x04, 0, 0],
            bat_cap: 97,
            uinp1: 229,
            model_name: "SENTINEL DUAL".to_string(),
            ..TelemetrySnapshot::default()
        }
    }

    fn telemetry_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| is_telemetry_file(p))
            .collect();
        files.sort();
        files
    }

    #[test]
    fn test_record_writes_json_line() {
        let dir = tempdir().unwrap();
        let mut recorder = TelemetryRecorder::new(dir.path(), 100, 5).unwrap();
        recorder.record(ProtocolFamily::Gpser, &snapshot()).unwrap();

        let contents = fs::read_to_string(recorder.current_path().unwrap()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);

        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["family"], "Gpser");
        assert_eq!(value["status"], "OL CHRG");
        assert_eq!(value["bat_cap"], 97);
        assert_eq!(value["model_name"], "SENTINEL DUAL");
        assert!(value["timestamp"].is_string());
        assert!(value.get("identif_bytes").is_none());
    }

    #[test]
    fn test_rotation_after_max_records() {
        let dir = tempdir().unwrap();
        let mut recorder = TelemetryRecorder::new(dir.path(), 2, 10).unwrap();
        for _ in 0..5 {
            recorder.record(ProtocolFamily::Sentry, &snapshot()).unwrap();
        }

        let files = telemetry_files(dir.path());
        assert_eq!(files.len(), 3);
        let counts: Vec<usize> = files
            .iter()
            .map(|p| fs::read_to_string(p).unwrap().lines().count())
            .collect();
        assert_eq!(counts, vec![2, 2, 1]);
    }

    #[test]
    fn test_retention_keeps_newest_files() {
        let dir = tempdir().unwrap();
        let mut recorder = TelemetryRecorder::new(dir.path(), 1, 2).unwrap();
        for _ in 0..5 {
            recorder.record(ProtocolFamily::Gpser, &snapshot()).unwrap();
        }

        let files = telemetry_files(dir.path());
        assert_eq!(files.len(), 2);
        assert_eq!(files.last().map(PathBuf::as_path), recorder.current_path());
    }

    #[test]
    fn test_unrelated_files_untouched() {
        let dir = tempdir().unwrap();
        let other = dir.path().join("notes.txt");
        fs::write(&other, "keep").unwrap();

        let mut recorder = TelemetryRecorder::new(dir.path(), 1, 1).unwrap();
        for _ in 0..3 {
            recorder.record(ProtocolFamily::Gpser, &snapshot()).unwrap();
        }
        assert!(other.exists());
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        TelemetryRecorder::new(&nested, 10, 10).unwrap();
        assert!(nested.is_dir());
    }
}
