use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::generator::Sample;

/// Samples read from a JSONL corpus, plus how many lines were dropped.
#[derive(Debug, Default)]
pub struct LoadedCorpus {
    pub samples: Vec<Sample>,
    pub skipped: usize,
}

/// Read a JSONL corpus. Blank lines are ignored; lines that are not JSON
/// objects with string `input` and `output` fields are skipped with a warning.
pub fn read_jsonl(path: &Path) -> Result<LoadedCorpus> {
    info!("reading data from {}", path.display());
    let file = File::open(path).with_context(|| format!("opening corpus {}", path.display()))?;
    let mut corpus = LoadedCorpus::default();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(sample) => corpus.samples.push(sample),
            Err(reason) => {
                warn!("skipping line {} ({reason}): {line}", line_no + 1);
                corpus.skipped += 1;
            }
        }
    }
    info!("loaded {} samples", corpus.samples.len());
    Ok(corpus)
}

fn parse_line(line: &str) -> std::result::Result<Sample, &'static str> {
    let value: Value = serde_json::from_str(line).map_err(|_| "invalid JSON")?;
    let field = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
    match (field("input"), field("output")) {
        (Some(input), Some(output)) => Ok(Sample { input, output }),
        _ => Err("missing keys"),
    }
}

/// How a sample is rendered into one training record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFormat {
    pub sep: String,
    pub stop_token: String,
}

impl Default for RecordFormat {
    fn default() -> Self {
        Self {
            sep: "=".to_string(),
            stop_token: "\n".to_string(),
        }
    }
}

impl RecordFormat {
    /// `input + sep + output + stop_token`, always in that order.
    pub fn render(&self, sample: &Sample) -> String {
        format!(
            "{}{}{}{}",
            sample.input, self.sep, sample.output, self.stop_token
        )
    }

    /// The prompt a consumer feeds the model to get `sample`'s answer.
    pub fn prompt(&self, input: &str) -> String {
        format!("{input}{}", self.sep)
    }
}

#[cfg(test)]
mod corpus_tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn skips_malformed_lines() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, r#"{{"input": "1+1", "output": "2"}}"#)?;
        writeln!(file)?;
        writeln!(file, "not json")?;
        writeln!(file, r#"{{"input": "2+2"}}"#)?;
        writeln!(file, r#"{{"input": 3, "output": "3"}}"#)?;
        writeln!(file, r#"{{"input": "2+2", "output": "4", "note": "extra"}}"#)?;
        file.flush()?;

        let corpus = read_jsonl(file.path())?;
        assert_eq!(corpus.skipped, 3);
        assert_eq!(
            corpus.samples,
            vec![Sample::addition(1, 1), Sample::addition(2, 2)]
        );
        Ok(())
    }

    #[test]
    fn missing_corpus_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_jsonl(&dir.path().join("absent.jsonl")).is_err());
    }

    #[test]
    fn renders_fields_in_fixed_order() {
        let format = RecordFormat::default();
        assert_eq!(format.render(&Sample::addition(12, 34)), "12+34=46\n");
        assert_eq!(format.prompt("12+34"), "12+34=");

        let format = RecordFormat {
            sep: " -> ".to_string(),
            stop_token: "$".to_string(),
        };
        assert_eq!(format.render(&Sample::addition(1, 2)), "1+2 -> 3$");
    }
}
