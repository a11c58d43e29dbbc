//! Chat transcript types
//!
//! The transcript is an append-only ordered sequence of turns; past entries
//! are never reordered or mutated. It lives for the process lifetime.

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// One committed chat turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Base64 S16 PCM from speech synthesis, when available.
    pub audio_data: Option<String>,
    /// `data:` URL from image generation, when available.
    pub image_url: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            audio_data: None,
            image_url: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            audio_data: None,
            image_url: None,
        }
    }
}

/// Append-only message log for one session.
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<ChatMessage>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.entries.push(message);
    }

    /// Commit an assistant turn unless the last entry is an assistant turn
    /// with identical content. Session replay or a retried turn-complete can
    /// otherwise double-append the same reply. Returns whether an entry was
    /// added.
    pub fn push_assistant_deduped(&mut self, content: impl Into<String>) -> bool {
        let content = content.into();
        if let Some(last) = self.entries.last() {
            if last.role == Role::Assistant && last.content == content {
                return false;
            }
        }
        self.entries.push(ChatMessage::assistant(content));
        true
    }

    pub fn entries(&self) -> &[ChatMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_order_is_preserved() {
        let mut transcript = Transcript::new();
        transcript.push(ChatMessage::user("一つ目"));
        transcript.push(ChatMessage::assistant("二つ目"));
        transcript.push(ChatMessage::user("三つ目"));

        let contents: Vec<&str> = transcript
            .entries()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["一つ目", "二つ目", "三つ目"]);
    }

    #[test]
    fn identical_consecutive_assistant_turns_commit_once() {
        let mut transcript = Transcript::new();
        assert!(transcript.push_assistant_deduped("阪神タイガースや"));
        assert!(!transcript.push_assistant_deduped("阪神タイガースや"));
        assert_eq!(transcript.len(), 1);
    }

    #[test]
    fn dedup_only_applies_to_the_last_entry() {
        let mut transcript = Transcript::new();
        assert!(transcript.push_assistant_deduped("ええで"));
        transcript.push(ChatMessage::user("もう一回"));
        assert!(transcript.push_assistant_deduped("ええで"));
        assert_eq!(transcript.len(), 3);
    }

    #[test]
    fn user_message_with_same_text_does_not_dedup() {
        let mut transcript = Transcript::new();
        transcript.push(ChatMessage::user("おはよう"));
        assert!(transcript.push_assistant_deduped("おはよう"));
        assert_eq!(transcript.len(), 2);
    }
}
