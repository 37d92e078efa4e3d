// Session recording: a gzipped JSONL stream of header, events and footer.
//
// Event lines carry the time elapsed since the previous line so a replay
// can reproduce the session's pacing. Files are named
// `breakglass_<first-8-of-session-id>.rec`.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::Result;

/// Kinds of recorded session activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Input,
    Output,
    Query,
    #[serde(rename = "result")]
    QueryResult,
    Error,
}

/// One line of the recording stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordLine {
    Header {
        session_id: String,
        user: String,
        started_at: chrono::DateTime<chrono::Utc>,
    },
    Event {
        kind: EventKind,
        duration_ms: u64,
        data: String,
    },
    Footer {
        ended_at: chrono::DateTime<chrono::Utc>,
        event_count: u64,
    },
}

pub struct SessionRecorder {
    encoder: GzEncoder<File>,
    path: PathBuf,
    last_event: Instant,
    event_count: u64,
}

impl SessionRecorder {
    /// Start a recording for a session, writing the header line.
    pub fn create(dir: &Path, session_id: &str, user: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let short_id: String = session_id.chars().take(8).collect();
        let path = dir.join(format!("breakglass_{short_id}.rec"));

        let file = File::create(&path)?;
        let mut recorder = Self {
            encoder: GzEncoder::new(file, Compression::default()),
            path,
            last_event: Instant::now(),
            event_count: 0,
        };
        recorder.write_line(&RecordLine::Header {
            session_id: session_id.to_string(),
            user: user.to_string(),
            started_at: chrono::Utc::now(),
        })?;
        Ok(recorder)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event with the elapsed time since the previous line.
    pub fn record(&mut self, kind: EventKind, data: impl Into<String>) -> Result<()> {
        let duration_ms = self.last_event.elapsed().as_millis() as u64;
        self.last_event = Instant::now();
        self.event_count += 1;
        self.write_line(&RecordLine::Event {
            kind,
            duration_ms,
            data: data.into(),
        })
    }

    /// Write the footer and flush the stream.
    pub fn finish(mut self) -> Result<PathBuf> {
        let footer = RecordLine::Footer {
            ended_at: chrono::Utc::now(),
            event_count: self.event_count,
        };
        self.write_line(&footer)?;
        self.encoder.try_finish()?;
        Ok(self.path)
    }

    fn write_line(&mut self, line: &RecordLine) -> Result<()> {
        let mut bytes = serde_json::to_vec(line)?;
        bytes.push(b'\n');
        self.encoder.write_all(&bytes)?;
        Ok(())
    }
}

/// Decode a recording back into its lines.
pub fn read_recording(path: &Path) -> Result<Vec<RecordLine>> {
    let file = File::open(path)?;
    let reader = BufReader::new(GzDecoder::new(file));
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        lines.push(serde_json::from_str(&line)?);
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let session_id = "0f9d3c21-aaaa-bbbb-cccc-000000000000";

        let mut recorder = SessionRecorder::create(dir.path(), session_id, "alice").unwrap();
        recorder
            .record(EventKind::Query, "SELECT count(*) FROM orders")
            .unwrap();
        recorder.record(EventKind::QueryResult, "1 row").unwrap();
        recorder.record(EventKind::Error, "permission denied").unwrap();
        let path = recorder.finish().unwrap();

        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "breakglass_0f9d3c21.rec"
        );

        let lines = read_recording(&path).unwrap();
        assert_eq!(lines.len(), 5);
        assert!(matches!(
            &lines[0],
            RecordLine::Header { user, .. } if user == "alice"
        ));
        assert!(matches!(
            &lines[1],
            RecordLine::Event { kind: EventKind::Query, .. }
        ));
        assert!(matches!(
            &lines[4],
            RecordLine::Footer { event_count: 3, .. }
        ));
    }
}
