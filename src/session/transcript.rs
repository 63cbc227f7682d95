//! Running transcript of the conversation, built from the agent's transcription events.

use crate::protocol::InboundMessage;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn. Blank transcripts are ignored. Returns whether a turn was added.
    pub fn record(&mut self, role: Role, content: &str) -> bool {
        let content = content.trim();
        if content.is_empty() {
            return false;
        }
        match role {
            Role::User => info!(transcript = %content, "[User]"),
            Role::Assistant => info!(transcript = %content, "[Agent]"),
        }
        self.turns.push(Turn {
            role,
            content: content.to_string(),
        });
        true
    }

    /// Record the transcript carried by `message`, if it is a transcription event.
    pub fn observe(&mut self, message: &InboundMessage) -> bool {
        match message {
            InboundMessage::UserTranscript { transcript } => self.record(Role::User, transcript),
            InboundMessage::AgentTranscript { transcript } => self.record(Role::Assistant, transcript),
            _ => false,
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn user_turns(&self) -> usize {
        self.turns.iter().filter(|t| t.role == Role::User).count()
    }

    pub fn agent_turns(&self) -> usize {
        self.turns.iter().filter(|t| t.role == Role::Assistant).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_both_sides_in_order() {
        let mut history = ConversationHistory::new();
        assert!(history.observe(&InboundMessage::AgentTranscript {
            transcript: "Tell me about a recent disagreement.".to_string(),
        }));
        assert!(history.observe(&InboundMessage::UserTranscript {
            transcript: " I told my manager directly. ".to_string(),
        }));
        assert!(!history.observe(&InboundMessage::SpeechStarted));

        assert_eq!(history.turns().len(), 2);
        assert_eq!(history.turns()[1].content, "I told my manager directly.");
        assert_eq!(history.user_turns(), 1);
        assert_eq!(history.agent_turns(), 1);
    }

    #[test]
    fn test_blank_transcripts_ignored() {
        let mut history = ConversationHistory::new();
        assert!(!history.record(Role::User, "   "));
        assert!(history.turns().is_empty());
    }
}
