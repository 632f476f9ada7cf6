//! Text sources and the format-tolerant CNAE table parser.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cnae_core::{IngestError, Record, RecordRejection, ValidationMode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "cnae-adapters";

/// Canonical classification table compiled into the binary.
pub const EMBEDDED_DATASET: &str = include_str!("../../../data/cnae_classifications.tsv");

/// Header label recognised at the start of a line.
pub const DEFAULT_HEADER_LABEL: &str = "CNAE";

const COMMENT_MARKERS: [&str; 3] = ["#", "--", "//"];

/// Anything that can hand the pipeline a UTF-8 text blob.
pub trait TextSource {
    fn describe(&self) -> String;
    fn read_text(&self) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TextSource for FileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn read_text(&self) -> Result<String> {
        let bytes = fs::read(&self.path).with_context(|| format!("reading {}", self.path.display()))?;
        String::from_utf8(bytes).with_context(|| format!("{} is not valid UTF-8", self.path.display()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StdinSource;

impl TextSource for StdinSource {
    fn describe(&self) -> String {
        "<stdin>".to_string()
    }

    fn read_text(&self) -> Result<String> {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("reading stdin as UTF-8")?;
        Ok(text)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedSource;

impl TextSource for EmbeddedSource {
    fn describe(&self) -> String {
        "<embedded cnae_classifications.tsv>".to_string()
    }

    fn read_text(&self) -> Result<String> {
        Ok(EMBEDDED_DATASET.to_string())
    }
}

/// `None` selects the embedded dataset, `-` reads stdin, anything else is a file path.
pub fn source_for_input(input: Option<&Path>) -> Box<dyn TextSource> {
    match input {
        None => Box::new(EmbeddedSource),
        Some(path) if path.as_os_str() == "-" => Box::new(StdinSource),
        Some(path) => Box::new(FileSource::new(path)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserConfig {
    pub mode: ValidationMode,
    pub header_label: String,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            mode: ValidationMode::default(),
            header_label: DEFAULT_HEADER_LABEL.to_string(),
        }
    }
}

impl ParserConfig {
    pub fn with_mode(mode: ValidationMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

/// Column splitting rule picked for a single line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delimiter {
    Tab,
    MultiSpace,
    Whitespace,
}

impl Delimiter {
    pub fn detect(line: &str) -> Self {
        if line.contains('\t') {
            Delimiter::Tab
        } else if line.contains("  ") {
            Delimiter::MultiSpace
        } else {
            Delimiter::Whitespace
        }
    }

    pub fn split(self, line: &str) -> Vec<&str> {
        match self {
            Delimiter::Tab => line.split('\t').map(str::trim).collect(),
            Delimiter::MultiSpace => split_on_space_runs(line),
            Delimiter::Whitespace => line.split_whitespace().collect(),
        }
    }
}

fn split_on_space_runs(line: &str) -> Vec<&str> {
    let bytes = line.as_bytes();
    let mut fields = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b' ' && bytes.get(i + 1) == Some(&b' ') {
            let end = i;
            while i < bytes.len() && bytes[i] == b' ' {
                i += 1;
            }
            fields.push(line[start..end].trim());
            start = i;
        } else {
            i += 1;
        }
    }
    fields.push(line[start..].trim());
    fields
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedLine {
    pub line: usize,
    pub content: String,
    pub reason: RecordRejection,
}

impl SkippedLine {
    pub fn to_error(&self) -> IngestError {
        IngestError::MalformedLine {
            line: self.line,
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseOutcome {
    pub records: Vec<Record>,
    pub skipped: Vec<SkippedLine>,
    pub headers: usize,
    pub comments: usize,
}

impl ParseOutcome {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn is_comment(line: &str) -> bool {
    COMMENT_MARKERS.iter().any(|marker| line.starts_with(marker))
}

fn starts_with_label(line: &str, label: &str) -> bool {
    !label.is_empty()
        && line
            .get(..label.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(label))
}

/// First token carries neither digits nor a code separator, so it cannot be a code.
fn looks_like_generic_header(fields: &[&str]) -> bool {
    fields.first().is_some_and(|first| {
        !first.is_empty()
            && !first.bytes().any(|b| b.is_ascii_digit() || b == b'-' || b == b'/')
    })
}

/// Splits one content line into a validated record.
pub fn parse_line(line: &str, mode: ValidationMode) -> Result<Record, RecordRejection> {
    let delimiter = Delimiter::detect(line);
    let fields = delimiter.split(line);
    if fields.len() < 3 {
        return Err(RecordRejection::TooFewFields(fields.len()));
    }
    Record::new(fields[0], fields[1], fields[2], mode)
}

/// Parses a classification table, one record per line.
///
/// Each line picks its own delimiter (tab, runs of two or more spaces, or any
/// whitespace). Blank lines, comments and headers are skipped; lines that fail
/// validation are reported in [`ParseOutcome::skipped`] and never abort the parse.
pub fn parse(text: &str, config: &ParserConfig) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    let mut seen_content = false;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if is_comment(line) {
            outcome.comments += 1;
            continue;
        }

        let first_content_line = !seen_content;
        seen_content = true;

        if starts_with_label(line, &config.header_label) {
            debug!(line = line_no, "skipping labelled header");
            outcome.headers += 1;
            continue;
        }
        if first_content_line && looks_like_generic_header(&Delimiter::detect(line).split(line)) {
            warn!(line = line_no, content = line, "treating first line as a header");
            outcome.headers += 1;
            continue;
        }

        match parse_line(line, config.mode) {
            Ok(record) => outcome.records.push(record),
            Err(reason) => {
                let skipped = SkippedLine {
                    line: line_no,
                    content: line.to_string(),
                    reason,
                };
                warn!(line = line_no, error = %skipped.to_error(), "skipping malformed line");
                outcome.skipped.push(skipped);
            }
        }
    }

    outcome
}

/// Lenient parse that only keeps the records.
pub fn parse_records(text: &str) -> Vec<Record> {
    parse(text, &ParserConfig::default()).records
}
