#![warn(missing_docs)]
//! Deterministic testing surfaces (scripted simulation + event stream).

pub mod sim;

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tandem_core::SimTick;

pub use sim::ScriptedSimulation;

/// Session event captured by demos and scenario tests.
#[derive(Debug, Serialize)]
pub struct EventRecord<'a> {
    /// Host simulation tick when the event occurred.
    pub tick: SimTick,
    /// Side that observed the event (`host` or `guest`).
    pub role: &'a str,
    /// Event label.
    pub kind: &'a str,
    /// Free-form detail.
    pub payload: &'a str,
}

/// A sink that writes newline-delimited JSON to disk.
pub struct JsonlSink {
    file: File,
    written: usize,
}

impl JsonlSink {
    /// Create a new sink at `path`, creating parent dirs if needed.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        Ok(Self { file, written: 0 })
    }

    /// Append an event to the log.
    pub fn write(&mut self, event: &EventRecord<'_>) -> Result<()> {
        let line = serde_json::to_string(event)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    /// Records written so far.
    pub fn written(&self) -> usize {
        self.written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn jsonl_sink_writes_one_line_per_record() {
        let path = std::env::temp_dir().join(format!(
            "tandem-events-{}/log.jsonl",
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let mut sink = JsonlSink::create(&path).expect("sink create");
        for kind in ["full_sync_applied", "round_started"] {
            sink.write(&EventRecord {
                tick: SimTick(4),
                role: "guest",
                kind,
                payload: "round=1",
            })
            .expect("write succeeds");
        }
        assert_eq!(sink.written(), 2);

        let contents = fs::read_to_string(&path).expect("file readable");
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("valid json");
        assert_eq!(first["kind"], "full_sync_applied");
        assert_eq!(first["tick"], 4);
    }
}
