//! JSON-lines signal files.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::Context;
use epiwatch_core::{IngestRecord, RawSignal};

pub enum SignalLine {
    Record(IngestRecord),
    Raw(RawSignal),
}

/// Parse every non-blank line. Lines that are not valid JSON for the
/// expected shape come back as errors with their 1-based line number;
/// only I/O failures abort the read.
pub fn read(path: &Path, raw: bool) -> anyhow::Result<Vec<(usize, Result<SignalLine, String>)>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut out = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed = if raw {
            serde_json::from_str(&line).map(SignalLine::Raw)
        } else {
            serde_json::from_str(&line).map(SignalLine::Record)
        };
        out.push((i + 1, parsed.map_err(|e| e.to_string())));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn records_parsed_and_bad_lines_numbered() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"source_class":"cbs","disease_candidates":[{{"name":"cholera","confidence":0.9}}],"symptoms":["vomiting"],"severity":3,"lat":-1.29,"lng":36.82,"timestamp":"2026-03-01T08:00:00Z"}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(file, "not json").unwrap();

        let lines = read(file.path(), false).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(matches!(lines[0], (1, Ok(SignalLine::Record(_)))));
        assert_eq!(lines[1].0, 3);
        assert!(lines[1].1.is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read(&dir.path().join("absent.jsonl"), false).is_err());
    }
}
