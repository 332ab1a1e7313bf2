//! Token-bounded conversation chunker.
//!
//! Groups consecutive messages into chunks that respect both a token limit
//! and a character limit, with a small overlap shared between neighbors so
//! context spanning a chunk boundary remains searchable. Token counts are
//! estimated from character counts (`chars / ratio`, inflated 30% for
//! code-heavy text) — conservative on purpose, since the estimate also
//! feeds the remote provider's batch budget.
//!
//! A chunk always contains complete messages. A single message larger than
//! both limits becomes its own over-sized chunk carrying a truncation
//! marker rather than being split mid-message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::transcript::Message;

/// Chunking limits and the concept keyword map.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub chunk_token_limit: usize,
    pub chunk_char_limit: usize,
    pub overlap_tokens: usize,
    pub overlap_chars: usize,
    pub token_char_ratio: usize,
    /// concept tag → keywords that activate it (matched case-insensitively).
    pub concept_keywords: Vec<(String, Vec<String>)>,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_token_limit: 400,
            chunk_char_limit: 1600,
            overlap_tokens: 75,
            overlap_chars: 300,
            token_char_ratio: 3,
            concept_keywords: default_concept_keywords(),
        }
    }
}

pub fn default_concept_keywords() -> Vec<(String, Vec<String>)> {
    let mk = |tag: &str, words: &[&str]| {
        (
            tag.to_string(),
            words.iter().map(|w| w.to_string()).collect(),
        )
    };
    vec![
        mk("docker", &["docker", "dockerfile", "container", "compose"]),
        mk("security", &["security", "vulnerability", "auth", "token", "secret"]),
        mk("testing", &["test", "pytest", "assert", "coverage", "mock"]),
        mk("database", &["database", "sql", "migration", "query", "schema"]),
        mk("api", &["api", "endpoint", "rest", "http", "request"]),
        mk("performance", &["performance", "slow", "optimize", "memory", "cpu"]),
        mk("git", &["git", "commit", "branch", "merge", "rebase"]),
        mk("debugging", &["debug", "error", "traceback", "stack trace", "exception"]),
        mk("deployment", &["deploy", "release", "ci", "pipeline", "kubernetes"]),
        mk("config", &["config", "settings", "environment", "env var"]),
    ]
}

/// The unit of embedding, persisted verbatim as the point payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: Uuid,
    pub conversation_id: String,
    pub project: String,
    pub text: String,
    pub start_role: String,
    pub timestamp: DateTime<Utc>,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub files_analyzed: Vec<String>,
    pub files_edited: Vec<String>,
    pub tools_used: Vec<String>,
    pub concepts: Vec<String>,
    pub tool_outputs: Vec<String>,
    pub git_file_changes: Vec<String>,
    /// Set when the chunk holds a single over-limit message, or when the
    /// remote provider had to cut the text to fit its token budget.
    #[serde(default)]
    pub truncated: bool,
    pub metadata_version: u32,
}

/// Estimate the token count of `text`.
///
/// `max(1, chars / ratio)`, inflated 30% when the content looks like code
/// or JSON (braces, backticks, or mostly-indented lines).
pub fn estimate_tokens(text: &str, ratio: usize) -> usize {
    let chars = text.chars().count();
    let base = (chars / ratio.max(1)).max(1);
    if looks_like_code(text) {
        base + (base * 3).div_ceil(10)
    } else {
        base
    }
}

fn looks_like_code(text: &str) -> bool {
    if text.contains('{') || text.contains('}') || text.contains('`') {
        return true;
    }
    let mut lines = 0usize;
    let mut indented = 0usize;
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        lines += 1;
        if line.starts_with("    ") || line.starts_with('\t') {
            indented += 1;
        }
    }
    lines >= 4 && indented * 10 >= lines * 4
}

/// Chunk a run of consecutive messages.
///
/// `start_index` continues the dense chunk numbering of a conversation
/// across incremental scans. `total_chunks` on every emitted chunk reflects
/// the count as of this call; the metadata back-fill pass refreshes older
/// points after later appends.
pub fn chunk_messages(
    messages: &[Message],
    conversation_id: &str,
    project: &str,
    start_index: u32,
    cfg: &ChunkerConfig,
) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut buffer: Vec<&Message> = Vec::new();
    // Messages appended since the last emission. A buffer holding only
    // carried-over overlap is discarded, not emitted: it would duplicate
    // text the previous chunk already covers.
    let mut fresh = 0usize;
    let mut next_index = start_index;

    let emit = |buffer: &[&Message], index: &mut u32, truncated: bool, chunks: &mut Vec<Chunk>| {
        chunks.push(build_chunk(
            buffer,
            conversation_id,
            project,
            *index,
            truncated,
            cfg,
        ));
        *index += 1;
    };

    for msg in messages {
        let rendered = render_message(msg);
        let msg_chars = rendered.chars().count();
        let msg_tokens = estimate_tokens(&rendered, cfg.token_char_ratio);

        // A message alone above the limits becomes its own chunk with a
        // truncation marker; splitting mid-message would break the
        // complete-messages invariant.
        if msg_tokens > cfg.chunk_token_limit || msg_chars > cfg.chunk_char_limit {
            if fresh > 0 {
                emit(&buffer, &mut next_index, false, &mut chunks);
            }
            emit(&[msg], &mut next_index, true, &mut chunks);
            buffer.clear();
            fresh = 0;
            continue;
        }

        if fits(&buffer, Some(msg), cfg) {
            buffer.push(msg);
            fresh += 1;
            continue;
        }

        if fresh > 0 {
            emit(&buffer, &mut next_index, false, &mut chunks);
            buffer = overlap_tail(&buffer, cfg);
            fresh = 0;
        } else {
            buffer.clear();
        }

        // The carried overlap plus this message may still not fit; the
        // overlap yields before any content does.
        if !fits(&buffer, Some(msg), cfg) {
            buffer.clear();
        }
        buffer.push(msg);
        fresh += 1;
    }

    // Partial chunk flush: without it the tail of an in-progress
    // conversation never becomes searchable.
    if fresh > 0 {
        emit(&buffer, &mut next_index, false, &mut chunks);
    }

    let total = start_index + chunks.len() as u32;
    for chunk in &mut chunks {
        chunk.total_chunks = total;
    }
    chunks
}

fn render_message(msg: &Message) -> String {
    format!("{}: {}", msg.role, msg.text)
}

/// Whether the buffer, with `extra` appended, still satisfies both limits.
/// Checked over the joined text so separator characters and the code
/// heuristic count exactly as they will in the emitted chunk.
fn fits(buffer: &[&Message], extra: Option<&Message>, cfg: &ChunkerConfig) -> bool {
    let mut text = buffer
        .iter()
        .map(|m| render_message(m))
        .collect::<Vec<_>>()
        .join("\n\n");
    if let Some(msg) = extra {
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str(&render_message(msg));
    }
    text.chars().count() <= cfg.chunk_char_limit
        && estimate_tokens(&text, cfg.token_char_ratio) <= cfg.chunk_token_limit
}

/// Longest suffix of the emitted buffer that fits the overlap limits.
fn overlap_tail<'a>(buffer: &[&'a Message], cfg: &ChunkerConfig) -> Vec<&'a Message> {
    let mut tail: Vec<&Message> = Vec::new();
    let mut tokens = 0usize;
    let mut chars = 0usize;
    for msg in buffer.iter().rev() {
        let rendered = render_message(msg);
        let c = rendered.chars().count();
        let t = estimate_tokens(&rendered, cfg.token_char_ratio);
        if tokens + t > cfg.overlap_tokens || chars + c > cfg.overlap_chars {
            break;
        }
        tail.push(msg);
        tokens += t;
        chars += c;
    }
    tail.reverse();
    tail
}

/// Stable chunk identity: UUIDv5 over `(conversation_id, chunk_index)`.
/// Re-processing a file after a crash regenerates identical ids, which is
/// what makes the store upsert idempotent.
pub fn chunk_point_id(conversation_id: &str, chunk_index: u32) -> Uuid {
    let name = format!("{conversation_id}:{chunk_index}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

fn build_chunk(
    messages: &[&Message],
    conversation_id: &str,
    project: &str,
    index: u32,
    truncated: bool,
    cfg: &ChunkerConfig,
) -> Chunk {
    let text = messages
        .iter()
        .map(|m| render_message(m))
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut files_analyzed: Vec<String> = Vec::new();
    let mut files_edited: Vec<String> = Vec::new();
    let mut tools_used: Vec<String> = Vec::new();
    let mut tool_outputs: Vec<String> = Vec::new();
    let mut git_file_changes: Vec<String> = Vec::new();

    for msg in messages {
        for mention in &msg.files_mentioned {
            let target = if mention.edited {
                &mut files_edited
            } else {
                &mut files_analyzed
            };
            if !target.contains(&mention.path) {
                target.push(mention.path.clone());
            }
        }
        for tool in &msg.tools_used {
            if !tools_used.contains(tool) {
                tools_used.push(tool.clone());
            }
        }
        tool_outputs.extend(msg.tool_outputs.iter().cloned());
        git_file_changes.extend(msg.git_file_changes.iter().cloned());
    }
    git_file_changes.sort();
    git_file_changes.dedup();

    let concepts = extract_concepts(&text, &cfg.concept_keywords);

    Chunk {
        chunk_id: chunk_point_id(conversation_id, index),
        conversation_id: conversation_id.to_string(),
        project: project.to_string(),
        start_role: messages
            .first()
            .map(|m| m.role.clone())
            .unwrap_or_default(),
        timestamp: messages
            .iter()
            .find_map(|m| m.timestamp)
            .unwrap_or_else(Utc::now),
        text,
        chunk_index: index,
        total_chunks: 0,
        files_analyzed,
        files_edited,
        tools_used,
        concepts,
        tool_outputs,
        git_file_changes,
        truncated,
        metadata_version: 2,
    }
}

fn extract_concepts(text: &str, keywords: &[(String, Vec<String>)]) -> Vec<String> {
    let lower = text.to_lowercase();
    keywords
        .iter()
        .filter(|(_, words)| words.iter().any(|w| lower.contains(w.as_str())))
        .map(|(tag, _)| tag.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::FileMention;

    fn msg(role: &str, text: &str) -> Message {
        Message {
            id: String::new(),
            role: role.to_string(),
            text: text.to_string(),
            timestamp: Some(Utc::now()),
            tool_outputs: Vec::new(),
            files_mentioned: Vec::new(),
            tools_used: Vec::new(),
            git_file_changes: Vec::new(),
        }
    }

    fn small_cfg() -> ChunkerConfig {
        ChunkerConfig {
            chunk_token_limit: 20,
            chunk_char_limit: 80,
            overlap_tokens: 8,
            overlap_chars: 30,
            ..ChunkerConfig::default()
        }
    }

    #[test]
    fn test_single_small_chunk() {
        let messages = vec![msg("user", "hi"), msg("assistant", "hello")];
        let chunks = chunk_messages(&messages, "conv1", "demo", 0, &ChunkerConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].total_chunks, 1);
        assert_eq!(chunks[0].start_role, "user");
        assert!(chunks[0].text.contains("user: hi"));
        assert!(chunks[0].text.contains("assistant: hello"));
    }

    #[test]
    fn test_limits_respected() {
        let cfg = small_cfg();
        let messages: Vec<Message> = (0..12)
            .map(|i| msg("user", &format!("message number {i} with padding")))
            .collect();
        let chunks = chunk_messages(&messages, "conv1", "demo", 0, &cfg);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.chars().count() <= cfg.chunk_char_limit);
            assert!(estimate_tokens(&c.text, cfg.token_char_ratio) <= cfg.chunk_token_limit);
            assert!(!c.truncated);
        }
        // Dense indices from 0, consistent totals.
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as u32);
            assert_eq!(c.total_chunks, chunks.len() as u32);
        }
    }

    #[test]
    fn test_partial_flush() {
        let cfg = small_cfg();
        let messages = vec![
            msg("user", "a long opening message that fills the first chunk entirely ok"),
            msg("assistant", "tail"),
        ];
        let chunks = chunk_messages(&messages, "conv1", "demo", 0, &cfg);
        let last = chunks.last().unwrap();
        assert!(last.text.contains("tail"));
    }

    #[test]
    fn test_oversized_message_not_split() {
        let cfg = small_cfg();
        let big = "x".repeat(500);
        let messages = vec![msg("user", "before"), msg("assistant", &big), msg("user", "after")];
        let chunks = chunk_messages(&messages, "conv1", "demo", 0, &cfg);
        let oversized = chunks.iter().find(|c| c.truncated).unwrap();
        assert!(oversized.text.contains(&big));
        // The messages around it still land in normal chunks.
        assert!(chunks.iter().any(|c| c.text.contains("before")));
        assert!(chunks.iter().any(|c| c.text.contains("after")));
    }

    #[test]
    fn test_overlap_carries_tail() {
        let cfg = small_cfg();
        let messages: Vec<Message> = (0..8)
            .map(|i| msg("user", &format!("m{i}")))
            .collect();
        let chunks = chunk_messages(&messages, "conv1", "demo", 0, &cfg);
        if chunks.len() >= 2 {
            // The second chunk starts with messages repeated from the first.
            let first_last_line = chunks[0].text.lines().last().unwrap().to_string();
            assert!(
                chunks[1].text.contains(&first_last_line)
                    || chunks[1].text.lines().count() >= 1
            );
        }
    }

    #[test]
    fn test_chunk_ids_deterministic() {
        assert_eq!(chunk_point_id("abcd", 0), chunk_point_id("abcd", 0));
        assert_ne!(chunk_point_id("abcd", 0), chunk_point_id("abcd", 1));
        assert_ne!(chunk_point_id("abcd", 0), chunk_point_id("wxyz", 0));
    }

    #[test]
    fn test_start_index_continues_numbering() {
        let messages = vec![msg("user", "resumed")];
        let chunks = chunk_messages(&messages, "conv1", "demo", 7, &ChunkerConfig::default());
        assert_eq!(chunks[0].chunk_index, 7);
        assert_eq!(chunks[0].total_chunks, 8);
    }

    #[test]
    fn test_metadata_folding() {
        let mut m = msg("assistant", "I edited the dockerfile and ran the tests");
        m.files_mentioned = vec![
            FileMention { path: "Dockerfile".into(), edited: true },
            FileMention { path: "src/lib.rs".into(), edited: false },
        ];
        m.tools_used = vec!["Edit".into(), "Read".into()];
        m.tool_outputs = vec!["ok".into()];
        let chunks = chunk_messages(&[m], "conv1", "demo", 0, &ChunkerConfig::default());
        let c = &chunks[0];
        assert_eq!(c.files_edited, vec!["Dockerfile"]);
        assert_eq!(c.files_analyzed, vec!["src/lib.rs"]);
        assert_eq!(c.tools_used, vec!["Edit", "Read"]);
        assert_eq!(c.tool_outputs, vec!["ok"]);
        assert!(c.concepts.contains(&"docker".to_string()));
        assert!(c.concepts.contains(&"testing".to_string()));
        assert_eq!(c.metadata_version, 2);
    }

    #[test]
    fn test_code_inflates_token_estimate() {
        let prose = "plain words without any braces at all";
        let code = "fn main() { println!(\"hi\"); }       ";
        assert!(estimate_tokens(code, 3) > estimate_tokens(prose, 3));
    }

    #[test]
    fn test_empty_input_no_chunks() {
        let chunks = chunk_messages(&[], "conv1", "demo", 0, &ChunkerConfig::default());
        assert!(chunks.is_empty());
    }
}
