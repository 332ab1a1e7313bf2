//! Append-only transcript parser.
//!
//! Transcripts are UTF-8 `.jsonl` files written by the host assistant, one
//! JSON record per line. Records are never rewritten; the only observable
//! change is the file growing, so the parser reads from a resumable byte
//! offset and reports the offset of the next unread line alongside every
//! message. Offsets are only advanced past fully consumed lines, which
//! keeps resumption line-aligned even if the process dies mid-scan.
//!
//! Malformed lines are skipped with a warning rather than aborting the
//! file — a single corrupt record must not make the rest of a conversation
//! unsearchable.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, warn};

use crate::error::RecallError;

/// A file path observed in a tool invocation, with enough provenance to
/// tell edits apart from reads downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMention {
    pub path: String,
    /// True when the producing tool writes (`edit`/`write` family), false
    /// for read-side tools (`read`/`grep`/`glob`).
    pub edited: bool,
}

/// Normalized projection of one transcript record.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub role: String,
    pub text: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub tool_outputs: Vec<String>,
    pub files_mentioned: Vec<FileMention>,
    pub tools_used: Vec<String>,
    pub git_file_changes: Vec<String>,
}

/// Caps applied while folding tool content into a [`Message`].
#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub max_tool_outputs: usize,
    pub max_tool_output_chars: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_tool_outputs: 15,
            max_tool_output_chars: 500,
        }
    }
}

// ============ Raw record shapes ============

#[derive(Deserialize)]
struct RawRecord {
    #[serde(rename = "type")]
    kind: Option<String>,
    uuid: Option<String>,
    timestamp: Option<String>,
    message: Option<RawMessage>,
}

#[derive(Deserialize)]
struct RawMessage {
    role: Option<String>,
    content: Option<RawContent>,
}

/// `message.content` is either a plain string or an ordered sequence of
/// heterogeneous parts.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        name: Option<String>,
        input: Option<serde_json::Value>,
    },
    #[serde(rename = "tool_result")]
    ToolResult { content: Option<ToolResultContent> },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ToolResultContent {
    Text(String),
    Parts(Vec<ToolResultPart>),
}

#[derive(Deserialize)]
struct ToolResultPart {
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
}

// ============ Reader ============

/// Streaming reader over one transcript file.
///
/// Not restartable mid-iteration: callers obtain a fresh reader per scan
/// and re-invoke with the new offset if the file grew in the meantime.
pub struct TranscriptReader {
    path: PathBuf,
    reader: BufReader<File>,
    offset: u64,
    limits: ParseLimits,
    line_buf: String,
}

impl TranscriptReader {
    /// Open `path` and seek to `resume_from`.
    ///
    /// Fails with [`RecallError::FileGone`] if the file no longer exists and
    /// [`RecallError::FileTruncated`] if it shrank below the resume offset.
    pub async fn open(path: &Path, resume_from: u64, limits: ParseLimits) -> Result<Self> {
        let file = match File::open(path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RecallError::FileGone(path.to_path_buf()).into());
            }
            Err(e) => return Err(e).context(format!("open transcript {}", path.display())),
        };

        let len = file.metadata().await?.len();
        if len < resume_from {
            return Err(RecallError::FileTruncated {
                path: path.to_path_buf(),
                offset: resume_from,
            }
            .into());
        }

        let mut reader = BufReader::new(file);
        reader
            .seek(std::io::SeekFrom::Start(resume_from))
            .await
            .context("seek to resume offset")?;

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            offset: resume_from,
            limits,
            line_buf: String::new(),
        })
    }

    /// Byte offset of the next unread line.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read forward until the next record that projects to a message.
    ///
    /// Returns `None` at EOF. The returned offset points at the start of
    /// the line after the consumed one.
    pub async fn next_message(&mut self) -> Result<Option<(Message, u64)>> {
        loop {
            self.line_buf.clear();
            let n = match self.reader.read_line(&mut self.line_buf).await {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(RecallError::FileGone(self.path.clone()).into());
                }
                Err(e) => return Err(e).context("read transcript line"),
            };
            if n == 0 {
                return Ok(None);
            }
            // A final line without a newline is still in flight; leave the
            // offset where it was so the next scan re-reads it complete.
            if !self.line_buf.ends_with('\n') {
                return Ok(None);
            }

            self.offset += n as u64;
            let line = self.line_buf.trim_end();
            if line.is_empty() {
                continue;
            }

            let record: RawRecord = match serde_json::from_str(line) {
                Ok(r) => r,
                Err(e) => {
                    warn!(path = %self.path.display(), offset = self.offset, error = %e,
                          "skipping malformed transcript line");
                    continue;
                }
            };

            if let Some(msg) = project_record(record, &self.limits) {
                return Ok(Some((msg, self.offset)));
            }
        }
    }
}

/// Fold one raw record into a [`Message`], or `None` when the record has
/// nothing searchable (summaries, empty content).
fn project_record(record: RawRecord, limits: &ParseLimits) -> Option<Message> {
    let kind = record.kind.as_deref().unwrap_or("");
    let raw = record.message?;

    let role = raw.role.clone().unwrap_or_else(|| kind.to_string());

    // Summary records carry no user/assistant content worth indexing.
    if kind == "summary" {
        return None;
    }

    let timestamp = record
        .timestamp
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_outputs: Vec<String> = Vec::new();
    let mut files_mentioned: Vec<FileMention> = Vec::new();
    let mut tools_used: Vec<String> = Vec::new();
    let mut git_file_changes: Vec<String> = Vec::new();

    match raw.content? {
        RawContent::Text(s) => {
            if !s.trim().is_empty() {
                text_parts.push(s);
            }
        }
        RawContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        if !text.trim().is_empty() {
                            text_parts.push(text);
                        }
                    }
                    ContentPart::ToolUse { name, input } => {
                        let tool = name.unwrap_or_default();
                        if !tool.is_empty() && !tools_used.contains(&tool) {
                            tools_used.push(tool.clone());
                        }
                        if let Some(input) = input {
                            for path in file_args(&input) {
                                let mention = FileMention {
                                    path,
                                    edited: is_edit_tool(&tool),
                                };
                                if !files_mentioned.contains(&mention) {
                                    files_mentioned.push(mention);
                                }
                            }
                        }
                    }
                    ContentPart::ToolResult { content } => {
                        if tool_outputs.len() >= limits.max_tool_outputs {
                            continue;
                        }
                        for output in tool_result_texts(content) {
                            if tool_outputs.len() >= limits.max_tool_outputs {
                                break;
                            }
                            git_file_changes.extend(extract_git_files(&output));
                            tool_outputs.push(truncate_chars(
                                &output,
                                limits.max_tool_output_chars,
                            ));
                        }
                    }
                    ContentPart::Other => {}
                }
            }
        }
    }

    let text = text_parts.join("\n");
    if text.trim().is_empty() && tool_outputs.is_empty() {
        return None;
    }

    git_file_changes.sort();
    git_file_changes.dedup();

    Some(Message {
        id: record.uuid.unwrap_or_default(),
        role,
        text,
        timestamp,
        tool_outputs,
        files_mentioned,
        tools_used,
        git_file_changes,
    })
}

/// Explicit file-path arguments in a tool invocation.
fn file_args(input: &serde_json::Value) -> Vec<String> {
    const KEYS: &[&str] = &["file_path", "path", "notebook_path"];
    let mut out = Vec::new();
    if let Some(obj) = input.as_object() {
        for key in KEYS {
            if let Some(v) = obj.get(*key).and_then(|v| v.as_str()) {
                if !v.is_empty() {
                    out.push(v.to_string());
                }
            }
        }
    }
    out
}

fn is_edit_tool(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("edit") || lower.contains("write")
}

fn tool_result_texts(content: Option<ToolResultContent>) -> Vec<String> {
    match content {
        Some(ToolResultContent::Text(s)) if !s.trim().is_empty() => vec![s],
        Some(ToolResultContent::Parts(parts)) => parts
            .into_iter()
            .filter(|p| p.kind.as_deref() == Some("text"))
            .filter_map(|p| p.text)
            .filter(|t| !t.trim().is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// File paths mentioned in git-style tool output (`git diff`, `git show`,
/// `git status`).
pub fn extract_git_files(output: &str) -> Vec<String> {
    static DIFF_RE: OnceLock<Regex> = OnceLock::new();
    static STATUS_RE: OnceLock<Regex> = OnceLock::new();

    let diff_re = DIFF_RE
        .get_or_init(|| Regex::new(r"(?m)^diff --git a/(\S+) b/(\S+)").unwrap());
    let status_re = STATUS_RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*(?:modified|new file|deleted|renamed):\s+(\S+)").unwrap()
    });

    let mut files = Vec::new();
    for caps in diff_re.captures_iter(output) {
        if let Some(m) = caps.get(2) {
            files.push(m.as_str().to_string());
        }
    }
    for caps in status_re.captures_iter(output) {
        if let Some(m) = caps.get(1) {
            files.push(m.as_str().to_string());
        }
    }
    files.sort();
    files.dedup();
    if !files.is_empty() {
        debug!(count = files.len(), "extracted git file changes");
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_lines(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
        f.flush().unwrap();
        f
    }

    fn user_line(text: &str) -> String {
        serde_json::json!({
            "type": "user",
            "uuid": "u1",
            "timestamp": "2026-01-05T10:00:00Z",
            "message": {"role": "user", "content": text}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_reads_string_content() {
        let f = write_lines(&[&user_line("hello there")]);
        let mut r = TranscriptReader::open(f.path(), 0, ParseLimits::default())
            .await
            .unwrap();
        let (msg, next) = r.next_message().await.unwrap().unwrap();
        assert_eq!(msg.text, "hello there");
        assert_eq!(msg.role, "user");
        assert!(msg.timestamp.is_some());
        assert!(next > 0);
        assert!(r.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offsets_are_line_aligned() {
        let l1 = user_line("first");
        let l2 = user_line("second");
        let f = write_lines(&[&l1, &l2]);

        let mut r = TranscriptReader::open(f.path(), 0, ParseLimits::default())
            .await
            .unwrap();
        let (_, after_first) = r.next_message().await.unwrap().unwrap();
        assert_eq!(after_first, l1.len() as u64 + 1);

        // Resuming from the reported offset yields exactly the second line.
        let mut r2 = TranscriptReader::open(f.path(), after_first, ParseLimits::default())
            .await
            .unwrap();
        let (msg, _) = r2.next_message().await.unwrap().unwrap();
        assert_eq!(msg.text, "second");
    }

    #[tokio::test]
    async fn test_skips_malformed_lines() {
        let good = user_line("kept");
        let f = write_lines(&["{not json", &good]);
        let mut r = TranscriptReader::open(f.path(), 0, ParseLimits::default())
            .await
            .unwrap();
        let (msg, _) = r.next_message().await.unwrap().unwrap();
        assert_eq!(msg.text, "kept");
    }

    #[tokio::test]
    async fn test_skips_summary_records() {
        let summary = serde_json::json!({
            "type": "summary",
            "message": {"content": "Session summary"}
        })
        .to_string();
        let f = write_lines(&[&summary]);
        let mut r = TranscriptReader::open(f.path(), 0, ParseLimits::default())
            .await
            .unwrap();
        assert!(r.next_message().await.unwrap().is_none());
        // Offset still advances past the skipped line.
        assert_eq!(r.offset(), summary.len() as u64 + 1);
    }

    #[tokio::test]
    async fn test_content_parts_folded() {
        let line = serde_json::json!({
            "type": "assistant",
            "uuid": "a1",
            "timestamp": "2026-01-05T10:01:00Z",
            "message": {"role": "assistant", "content": [
                {"type": "text", "text": "Let me look."},
                {"type": "tool_use", "name": "Read", "input": {"file_path": "src/lib.rs"}},
                {"type": "tool_use", "name": "Edit", "input": {"file_path": "src/main.rs"}},
                {"type": "tool_result", "content": "fn main() {}"}
            ]}
        })
        .to_string();
        let f = write_lines(&[&line]);
        let mut r = TranscriptReader::open(f.path(), 0, ParseLimits::default())
            .await
            .unwrap();
        let (msg, _) = r.next_message().await.unwrap().unwrap();
        assert_eq!(msg.text, "Let me look.");
        assert_eq!(msg.tool_outputs, vec!["fn main() {}"]);
        assert_eq!(msg.tools_used, vec!["Read", "Edit"]);
        assert_eq!(
            msg.files_mentioned,
            vec![
                FileMention { path: "src/lib.rs".into(), edited: false },
                FileMention { path: "src/main.rs".into(), edited: true },
            ]
        );
    }

    #[tokio::test]
    async fn test_tool_output_caps() {
        let limits = ParseLimits {
            max_tool_outputs: 2,
            max_tool_output_chars: 5,
        };
        let parts: Vec<serde_json::Value> = (0..4)
            .map(|i| {
                serde_json::json!({"type": "tool_result", "content": format!("output-{i}-long")})
            })
            .collect();
        let line = serde_json::json!({
            "type": "assistant",
            "message": {"role": "assistant", "content": parts}
        })
        .to_string();
        let f = write_lines(&[&line]);
        let mut r = TranscriptReader::open(f.path(), 0, limits).await.unwrap();
        let (msg, _) = r.next_message().await.unwrap().unwrap();
        assert_eq!(msg.tool_outputs.len(), 2);
        assert!(msg.tool_outputs.iter().all(|o| o.chars().count() <= 5));
    }

    #[tokio::test]
    async fn test_gone_and_truncated() {
        let gone = TranscriptReader::open(
            Path::new("/nonexistent/xyz.jsonl"),
            0,
            ParseLimits::default(),
        )
        .await;
        let err = gone.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<RecallError>(),
            Some(RecallError::FileGone(_))
        ));

        let f = write_lines(&[&user_line("short")]);
        let trunc = TranscriptReader::open(f.path(), 10_000, ParseLimits::default()).await;
        let err = trunc.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<RecallError>(),
            Some(RecallError::FileTruncated { .. })
        ));
    }

    #[test]
    fn test_extract_git_files() {
        let out = "diff --git a/src/lib.rs b/src/lib.rs\nindex 123..456\n\
                   \tmodified:   src/main.rs\n\tnew file:   docs/notes.md\n";
        let files = extract_git_files(out);
        assert_eq!(files, vec!["docs/notes.md", "src/lib.rs", "src/main.rs"]);
    }
}
