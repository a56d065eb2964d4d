use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Bounded user/assistant exchange log of one conversation.
///
/// Messages always start with a user turn and alternate. When an append
/// pushes the length past `cap`, whole user+assistant pairs are evicted from
/// the front, so the cap is kept even.
#[derive(Debug, Clone)]
pub struct History {
    messages: Vec<ChatMessage>,
    cap: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAP)
    }
}

impl History {
    pub const DEFAULT_CAP: usize = 10;

    pub fn new(cap: usize) -> Self {
        let cap = cap.max(2);
        let cap = cap + cap % 2;
        Self {
            messages: Vec::with_capacity(cap + 1),
            cap,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Append a user turn. An unanswered user turn left at the end is
    /// replaced rather than stacked.
    pub fn push_user(&mut self, content: impl Into<String>) {
        self.discard_pending_user();
        self.messages.push(ChatMessage::user(content));
        self.truncate();
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::assistant(content));
        self.truncate();
    }

    /// Remove a trailing user turn that never got its reply.
    pub fn discard_pending_user(&mut self) -> bool {
        if self.messages.last().map(|m| m.role) == Some(Role::User) {
            self.messages.pop();
            return true;
        }
        false
    }

    /// The assistant turn that closes the log, if any.
    pub fn last_reply(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }

    /// Messages to send to the generator: the system prompt followed by the
    /// exchange log.
    pub fn to_prompt(&self, system_prompt: &str) -> Vec<ChatMessage> {
        let mut prompt = Vec::with_capacity(self.messages.len() + 1);
        if !system_prompt.is_empty() {
            prompt.push(ChatMessage::system(system_prompt));
        }
        prompt.extend(self.messages.iter().cloned());
        prompt
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    fn truncate(&mut self) {
        while self.messages.len() > self.cap {
            let evict = 2.min(self.messages.len());
            self.messages.drain(..evict);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(history: &mut History, n: usize) {
        for i in 0..n {
            history.push_user(format!("q{i}"));
            history.push_assistant(format!("a{i}"));
        }
    }

    fn alternates(history: &History) -> bool {
        history.messages().iter().enumerate().all(|(i, m)| {
            let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
            m.role == expected
        })
    }

    #[test]
    fn test_cap_is_even_and_at_least_two() {
        assert_eq!(History::new(0).cap(), 2);
        assert_eq!(History::new(7).cap(), 8);
        assert_eq!(History::new(10).cap(), 10);
    }

    #[test]
    fn test_oldest_pairs_are_evicted_together() {
        let mut history = History::new(4);
        exchange(&mut history, 5);

        assert_eq!(history.len(), 4);
        assert!(alternates(&history));
        assert_eq!(history.messages()[0].content, "q3");
        assert_eq!(history.last_reply(), Some("a4"));
    }

    #[test]
    fn test_pending_user_turn_keeps_alternation() {
        let mut history = History::new(4);
        exchange(&mut history, 2);
        history.push_user("q2");
        assert_eq!(history.len(), 3);
        assert_eq!(history.messages()[0].content, "q1");
        assert!(alternates(&history));
        assert_eq!(history.last_reply(), None);

        assert!(history.discard_pending_user());
        assert!(!history.discard_pending_user());
        assert_eq!(history.len(), 2);
        assert_eq!(history.last_reply(), Some("a1"));
    }

    #[test]
    fn test_dangling_user_turn_is_replaced() {
        let mut history = History::default();
        history.push_user("first");
        history.push_user("second");
        assert_eq!(history.messages(), &[ChatMessage::user("second")]);
    }

    #[test]
    fn test_prompt_starts_with_system_message() {
        let mut history = History::default();
        exchange(&mut history, 1);
        let prompt = history.to_prompt("be brief");
        assert_eq!(prompt.len(), 3);
        assert_eq!(prompt[0], ChatMessage::system("be brief"));
        assert_eq!(prompt[1].role, Role::User);

        assert_eq!(history.to_prompt("").len(), 2);
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }
}
