//! Text helpers for prompt building and parsing generated output

use std::borrow::Cow;

pub struct TextUtils;

impl TextUtils {
    /// Collapse runs of whitespace (including newlines) into single spaces
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        let needs_work = text.trim() != text
            || text
                .char_indices()
                .any(|(i, c)| c.is_whitespace() && (c != ' ' || text[i + 1..].starts_with(char::is_whitespace)));
        if needs_work {
            Cow::Owned(text.split_whitespace().collect::<Vec<_>>().join(" "))
        } else {
            Cow::Borrowed(text)
        }
    }

    /// Keep at most `n` whitespace-separated words
    pub fn first_words(text: &str, n: usize) -> String {
        text.split_whitespace().take(n).collect::<Vec<_>>().join(" ")
    }

    pub fn count_words(text: &str) -> usize {
        text.split_whitespace().count()
    }

    /// Truncate to `max_chars` characters, appending an ellipsis when cut
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            return Cow::Borrowed(text);
        }
        if max_chars <= 3 {
            return Cow::Borrowed("...");
        }
        let mut result: String = text.chars().take(max_chars - 3).collect();
        result.push_str("...");
        Cow::Owned(result)
    }

    /// The substring from the first `{` to the last `}`, if both exist in order.
    /// Models often wrap JSON answers in prose or code fences.
    pub fn extract_json_object(text: &str) -> Option<&str> {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        (end > start).then(|| &text[start..=end])
    }

    /// Strip quotes and trailing punctuation models like to add around short answers
    pub fn clean_generated(text: &str) -> String {
        let trimmed = text
            .trim()
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
            .trim();
        Self::normalize_whitespace(trimmed).into_owned()
    }
}
