use async_trait::async_trait;
use serde_json::Value;

use crate::errors::ChannelResult;

/// A single inline-keyboard button: visible label plus the callback data
/// delivered back on tap (spec §4.8 `personal:N` / `group:N` / `session:N`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackButton {
    pub label: String,
    pub data: String,
}

/// A rendered outbound message, carrying optional inline buttons. The
/// core never knows which provider renders it.
#[derive(Debug, Clone, Default)]
pub struct OutboundNotification {
    pub chat_id: String,
    pub text: String,
    pub buttons: Vec<CallbackButton>,
}

impl OutboundNotification {
    pub fn text(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            text: text.into(),
            buttons: Vec::new(),
        }
    }
}

/// Inbound webhook payload, already decoded into one of the two shapes
/// the command router understands (spec §6 "Inbound `update`").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundUpdate {
    Text { sender_id: String, chat_id: String, text: String },
    Callback { sender_id: String, chat_id: String, data: String },
}

/// The interface the core depends on (spec §9 "dynamic dispatch over
/// channels"): `send` plus `receiveUpdate`. Provider-specific formatting
/// and transport live entirely behind implementors of this trait.
#[async_trait]
pub trait ChatChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, notification: &OutboundNotification) -> ChannelResult<()>;

    /// Decode a raw webhook body into an `InboundUpdate`. Returns `Ok(None)`
    /// for update shapes the router has no use for (e.g. edited-message
    /// notifications), rather than treating them as errors.
    fn parse_update(&self, raw: &Value) -> ChannelResult<Option<InboundUpdate>>;
}

/// Maximum textual payload per send before the aggregator must split
/// (spec §6: "a single send is limited to ~4090 textual characters").
pub const MAX_MESSAGE_CHARS: usize = 4090;

/// Split `text` into chunks of at most `limit` bytes, preferring to break
/// on paragraph then line boundaries, always on a UTF-8 char boundary.
/// Ported from the teacher's `channels::base::split_message`.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while remaining.len() > limit {
        let mut split_at = limit;
        while split_at > 0 && !remaining.is_char_boundary(split_at) {
            split_at -= 1;
        }
        if split_at == 0 {
            split_at = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }

        if let Some(idx) = remaining[..split_at].rfind("\n\n") {
            chunks.push(remaining[..idx].trim().to_string());
            remaining = &remaining[idx + 2..];
            continue;
        }

        if let Some(idx) = remaining[..split_at].rfind('\n') {
            chunks.push(remaining[..idx].trim().to_string());
            remaining = &remaining[idx + 1..];
            continue;
        }

        chunks.push(remaining[..split_at].to_string());
        remaining = &remaining[split_at..];
    }

    if !remaining.is_empty() {
        chunks.push(remaining.trim().to_string());
    }

    chunks
}

/// Renders the "Part k/N" prefix the aggregator adds to split messages,
/// so a long notification reads coherently across several chat messages.
pub fn label_parts(chunks: Vec<String>) -> Vec<String> {
    let total = chunks.len();
    if total <= 1 {
        return chunks;
    }
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| format!("Part {}/{}\n{}", i + 1, total, chunk))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_chunk() {
        let chunks = split_message("hello", 4090);
        assert_eq!(chunks, vec!["hello".to_string()]);
    }

    #[test]
    fn splits_on_paragraph_boundary() {
        let text = format!("{}\n\n{}", "a".repeat(10), "b".repeat(10));
        let chunks = split_message(&text, 15);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(10));
        assert_eq!(chunks[1], "b".repeat(10));
    }

    #[test]
    fn hard_cuts_when_no_boundary_available() {
        let text = "x".repeat(30);
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 10));
    }

    #[test]
    fn label_parts_only_prefixes_when_multiple() {
        assert_eq!(label_parts(vec!["only".to_string()]), vec!["only".to_string()]);
        let labeled = label_parts(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(labeled[0], "Part 1/2\na");
        assert_eq!(labeled[1], "Part 2/2\nb");
    }
}
