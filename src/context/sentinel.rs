//! Truncation sentinel text.
//!
//! Grounded: `original_source/backend/core/agentpress/context_manager.py`
//! writes a human-readable marker pointing at the `expand-message` tool so a
//! user (or the model, on request) can recover the original content; spec §7
//! requires every truncation sentinel to mention that tool.

use uuid::Uuid;

pub fn tool_output_removed(message_id: Uuid) -> String {
    format!(
        "Tool output removed for token management. Original content is preserved; message_id \"{message_id}\". Use the expand-message tool to view it in full."
    )
}

pub fn truncated_with_reference(message_id: Uuid, truncated: &str) -> String {
    format!(
        "{truncated}\n\n[... truncated for token management; message_id \"{message_id}\". Use the expand-message tool to view it in full.]"
    )
}

/// Keep the first half, a middle marker, and the last half — used for
/// single messages too large to keep whole (spec §4.4 step 7, and the
/// boundary behaviour "a single message larger than budget").
pub fn safe_truncate_middle(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let marker = "\n\n... [content truncated] ...\n\n";
    let remaining = max_chars.saturating_sub(marker.len());
    let half = remaining / 2;
    let first = take_chars(text, half);
    let last = take_chars_from_end(text, remaining - half);
    format!("{first}{marker}{last}")
}

fn take_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn take_chars_from_end(s: &str, n: usize) -> String {
    let total = s.chars().count();
    let skip = total.saturating_sub(n);
    s.chars().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(safe_truncate_middle("hello", 100), "hello");
    }

    #[test]
    fn long_text_is_truncated_and_fits() {
        let text = "a".repeat(10_000);
        let out = safe_truncate_middle(&text, 1000);
        assert!(out.len() <= 1000 + 40);
        assert!(out.contains("truncated"));
        assert!(out.starts_with("aaa"));
        assert!(out.ends_with("aaa"));
    }
}
