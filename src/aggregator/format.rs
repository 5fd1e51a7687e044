use serde_json::Value;

use relay_channels::{label_parts, split_message, OutboundNotification, MAX_MESSAGE_CHARS};

/// Renders the agent report into the single textual payload the chat
/// channel sees, splitting into labelled parts above the channel's
/// per-message ceiling (spec §4.7 step 5).
pub fn format_notification(
    server_id: &str,
    project: &str,
    identifier: &str,
    metadata: &Value,
) -> Vec<String> {
    let label = server_id.to_uppercase();
    let mut body = format!("[{label}] {project}\nSession: {identifier}");

    if let Some(question) = metadata.get("userQuestion").and_then(Value::as_str) {
        if !question.is_empty() {
            body.push_str(&format!("\n\nQ: {question}"));
        }
    }
    if let Some(response) = metadata.get("claudeResponse").and_then(Value::as_str) {
        if !response.is_empty() {
            body.push_str(&format!("\n\nA: {response}"));
        }
    }
    body.push_str(&format!("\n\n/cmd {identifier} <command>"));

    label_parts(split_message(&body, MAX_MESSAGE_CHARS))
}

/// Builds one or more outbound notifications (multi-part messages are
/// sent as separate chat messages, each carrying the same chat target).
pub fn build_notifications(chat_id: &str, parts: Vec<String>) -> Vec<OutboundNotification> {
    parts
        .into_iter()
        .map(|text| OutboundNotification::text(chat_id, text))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn formats_full_report() {
        let metadata = json!({"userQuestion": "?", "claudeResponse": "done"});
        let parts = format_notification("kr4", "demo", "kr4:1", &metadata);
        assert_eq!(parts.len(), 1);
        let body = &parts[0];
        assert!(body.contains("KR4"));
        assert!(body.contains("kr4:1"));
        assert!(body.contains("demo"));
        assert!(body.contains('?'));
        assert!(body.contains("done"));
    }

    #[test]
    fn omits_absent_metadata_fields() {
        let metadata = json!({});
        let parts = format_notification("kr4", "demo", "kr4:1", &metadata);
        assert!(!parts[0].contains("Q:"));
        assert!(!parts[0].contains("A:"));
    }

    #[test]
    fn splits_long_payload_into_labelled_parts() {
        let metadata = json!({"claudeResponse": "x".repeat(10_000)});
        let parts = format_notification("kr4", "demo", "kr4:1", &metadata);
        assert!(parts.len() > 1);
        assert!(parts[0].starts_with("Part 1/"));
    }
}
