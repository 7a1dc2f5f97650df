//! Append-only CSV recognition log.
//!
//! Columns: `timestamp,person_id,person_name,confidence,location`. The header
//! is written once when the file is created (or found empty); later sessions
//! only append rows.

use crate::types::LabelIndex;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const LOG_HEADER: [&str; 5] = ["timestamp", "person_id", "person_name", "confidence", "location"];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum EventLogError {
    #[error("recognition log {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("recognition log {path} line {line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// One logged identification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionEvent {
    pub timestamp: DateTime<Local>,
    /// Label index in string form, the cooldown key.
    pub person_id: String,
    pub display_name: String,
    pub confidence: f32,
    pub location: String,
}

impl RecognitionEvent {
    pub fn label_index(&self) -> Option<LabelIndex> {
        self.person_id.parse().ok()
    }

    fn to_row(&self) -> String {
        let fields = [
            self.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            self.person_id.clone(),
            self.display_name.clone(),
            self.confidence.to_string(),
            self.location.clone(),
        ];
        join_row(fields.iter().map(String::as_str))
    }
}

/// Destination for emitted events.
pub trait EventSink {
    fn append(&mut self, event: &RecognitionEvent) -> Result<(), EventLogError>;
}

impl EventSink for Vec<RecognitionEvent> {
    fn append(&mut self, event: &RecognitionEvent) -> Result<(), EventLogError> {
        self.push(event.clone());
        Ok(())
    }
}

/// CSV file sink. Each event is written and flushed before `append` returns.
#[derive(Debug)]
pub struct RecognitionLog {
    path: PathBuf,
}

impl RecognitionLog {
    /// Open (creating with a header if needed) the log at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, EventLogError> {
        let path = path.into();
        let io_err = |source| EventLogError::Io {
            path: path.clone(),
            source,
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;

        if file.metadata().map_err(io_err)?.len() == 0 {
            writeln!(file, "{}", join_row(LOG_HEADER.iter().copied())).map_err(io_err)?;
            tracing::info!(path = %path.display(), "created recognition log");
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse every row of the log at `path`.
    pub fn read_all(path: &Path) -> Result<Vec<RecognitionEvent>, EventLogError> {
        let text = std::fs::read_to_string(path).map_err(|source| EventLogError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut events = Vec::new();
        for (i, (line_no, fields)) in split_records(&text).into_iter().enumerate() {
            if i == 0 && fields.iter().map(String::as_str).eq(LOG_HEADER) {
                continue;
            }
            events.push(parse_event(&fields).map_err(|reason| EventLogError::Parse {
                path: path.to_path_buf(),
                line: line_no,
                reason,
            })?);
        }
        Ok(events)
    }
}

impl EventSink for RecognitionLog {
    fn append(&mut self, event: &RecognitionEvent) -> Result<(), EventLogError> {
        let io_err = |source| EventLogError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        writeln!(file, "{}", event.to_row()).map_err(io_err)?;
        file.flush().map_err(io_err)
    }
}

fn parse_event(fields: &[String]) -> Result<RecognitionEvent, String> {
    let [timestamp, person_id, name, confidence, location] = fields else {
        return Err(format!("expected 5 fields, found {}", fields.len()));
    };
    let naive = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .map_err(|e| format!("bad timestamp {timestamp:?}: {e}"))?;
    let timestamp = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| format!("timestamp {naive} does not exist in the local timezone"))?;
    let confidence = confidence
        .parse()
        .map_err(|_| format!("bad confidence {confidence:?}"))?;

    Ok(RecognitionEvent {
        timestamp,
        person_id: person_id.clone(),
        display_name: name.clone(),
        confidence,
        location: location.clone(),
    })
}

fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn join_row<'a>(fields: impl Iterator<Item = &'a str>) -> String {
    fields.map(quote_field).collect::<Vec<_>>().join(",")
}

/// Split CSV text into records tagged with the line each one starts on.
/// Quoted fields may span line breaks; blank lines are dropped.
fn split_records(text: &str) -> Vec<(usize, Vec<String>)> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut start = 1;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if current.is_empty() => in_quotes = true,
            (',', false) => fields.push(std::mem::take(&mut current)),
            ('\r', false) if chars.peek() == Some(&'\n') => {}
            ('\n', false) => {
                fields.push(std::mem::take(&mut current));
                records.push((start, std::mem::take(&mut fields)));
                line += 1;
                start = line;
            }
            ('\n', true) => {
                current.push(c);
                line += 1;
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() || !fields.is_empty() {
        fields.push(current);
        records.push((start, fields));
    }
    records.retain(|(_, fields)| !matches!(fields.as_slice(), [only] if only.trim().is_empty()));
    records
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str, location: &str) -> RecognitionEvent {
        RecognitionEvent {
            timestamp: Local.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap(),
            person_id: "0".into(),
            display_name: name.into(),
            confidence: 0.875,
            location: location.into(),
        }
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recognition_log.csv");

        let mut log = RecognitionLog::open(&path).unwrap();
        log.append(&event("Alice", "Lobby")).unwrap();
        drop(log);

        let mut log = RecognitionLog::open(&path).unwrap();
        log.append(&event("Bob", "Lobby")).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "timestamp,person_id,person_name,confidence,location");
        assert_eq!(lines[1], "2024-03-01 09:30:00,0,Alice,0.875,Lobby");
        assert_eq!(text.matches("timestamp").count(), 1);
    }

    #[test]
    fn test_fields_with_commas_are_quoted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut log = RecognitionLog::open(&path).unwrap();
        let tricky = event("Doe, \"JD\" John", "Gate 3, North");
        log.append(&tricky).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"Doe, \"\"JD\"\" John\""));

        let events = RecognitionLog::read_all(&path).unwrap();
        assert_eq!(events, vec![tricky]);
    }

    #[test]
    fn test_read_all_reports_bad_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        std::fs::write(&path, "timestamp,person_id,person_name,confidence,location\nbroken\n").unwrap();
        let err = RecognitionLog::read_all(&path).unwrap_err();
        assert!(matches!(err, EventLogError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_split_records_plain_and_quoted() {
        let records = split_records("a,b,,c\r\n\n\"x,y\",z\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (1, vec!["a".into(), "b".into(), "".into(), "c".into()]));
        assert_eq!(records[1], (3, vec!["x,y".into(), "z".into()]));
    }

    #[test]
    fn test_newline_in_field_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut log = RecognitionLog::open(&path).unwrap();
        let multiline = event("Ann\nLee", "Dock\r\nEast");
        log.append(&multiline).unwrap();
        log.append(&event("Bob", "Lobby")).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"broken\n")
            .unwrap();

        let err = RecognitionLog::read_all(&path).unwrap_err();
        assert!(matches!(err, EventLogError::Parse { line: 6, .. }));

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.trim_end_matches("broken\n")).unwrap();
        let events = RecognitionLog::read_all(&path).unwrap();
        assert_eq!(events, vec![multiline, event("Bob", "Lobby")]);
    }

    #[test]
    fn test_event_label_index() {
        assert_eq!(event("A", "L").label_index(), Some(0));
    }
}
