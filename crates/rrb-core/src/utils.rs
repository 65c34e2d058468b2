use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};

use crate::{
    ports::{ConversationEntry, ConversationLogger},
    Result,
};

// ============== Timestamp Helpers ==============

/// RFC3339 timestamp in UTC (for logs/telemetry).
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

// ============== Text Helpers ==============

pub fn truncate_text(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out = s.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}

/// Short, stable fingerprint of a secret, safe to print in logs.
pub fn key_fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex_prefix(&digest, 8)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(len);
    for b in bytes {
        let _ = write!(&mut out, "{:02x}", b);
        if out.len() >= len {
            out.truncate(len);
            break;
        }
    }
    out
}

// ============== Conversation Log ==============

const LOG_MAX_TEXT: usize = 2000;

/// Append-only JSONL conversation sink.
#[derive(Debug)]
pub struct JsonlConversationLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlConversationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ConversationLogger for JsonlConversationLog {
    async fn record(&self, mut entry: ConversationEntry) -> Result<()> {
        entry.user_message = truncate_text(&entry.user_message, LOG_MAX_TEXT);
        entry.bot_response = truncate_text(&entry.bot_response, LOG_MAX_TEXT);
        entry.user_context_snapshot = truncate_text(&entry.user_context_snapshot, LOG_MAX_TEXT);

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{KeySource, SenderId};
    use std::time::Duration;

    fn tmp_file(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_nanos();
        let pid = std::process::id();
        PathBuf::from(format!("/tmp/{prefix}-{pid}-{ts}.jsonl"))
    }

    fn entry(msg: &str) -> ConversationEntry {
        ConversationEntry {
            timestamp: iso_timestamp_utc(),
            sender: SenderId::new("U1"),
            display_name: "Amy".to_string(),
            user_message: msg.to_string(),
            bot_response: "ok".to_string(),
            response_type: "chitchat".to_string(),
            filter_result: "safe".to_string(),
            model_name: Some("m".to_string()),
            key_source: Some(KeySource::Free),
            latency_ms: 12,
            user_context_snapshot: String::new(),
            recommendations: None,
        }
    }

    #[test]
    fn truncate_text_counts_chars_not_bytes() {
        assert_eq!(truncate_text("笨蛋機器人", 5), "笨蛋機器人");
        assert_eq!(truncate_text("笨蛋機器人", 2), "笨蛋...");
    }

    #[test]
    fn fingerprint_is_short_and_stable() {
        let a = key_fingerprint("secret-key");
        assert_eq!(a.len(), 8);
        assert_eq!(a, key_fingerprint("secret-key"));
        assert_ne!(a, key_fingerprint("other-key"));
    }

    #[tokio::test]
    async fn jsonl_log_appends_one_line_per_entry() {
        let log = JsonlConversationLog::new(tmp_file("rrb-convlog-test"));
        log.record(entry("hi")).await.unwrap();
        log.record(entry(&"x".repeat(LOG_MAX_TEXT + 5))).await.unwrap();

        let written = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["userMessage"], "hi");
        assert_eq!(first["keySource"], "free");
        assert_eq!(first["filterResult"], "safe");
        assert!(lines[1].contains("..."));
    }
}
