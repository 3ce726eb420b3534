//! Transcript Manager (C6).
//!
//! Produces, on call end, a single canonical ordered list of (role, text)
//! turns and persists it. Construction invariant (§3): before persistence,
//! any two adjacent turns with the same role are merged into one,
//! concatenated with a single separator.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::TranscriptError;
use crate::persistence::PersistenceClient;

/// A turn's role, matching the LLM's own input/output transcription
/// attribution (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One role-attributed text fragment (§GLOSSARY).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

/// Ordered, append-only accumulator for one call's conversation.
#[derive(Debug, Clone, Default)]
pub struct TranscriptManager {
    turns: Vec<Turn>,
    pending_assistant_text: String,
}

impl TranscriptManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn. Empty or whitespace-only text is ignored (§4.3).
    pub fn add_turn(&mut self, role: Role, text: &str) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        self.turns.push(Turn { role, text: trimmed.to_string() });
    }

    /// Accumulate streamed assistant text fragments that arrive ahead of
    /// an explicit end-of-turn marker (LLM's `AssistantText` frames),
    /// flushed as a single turn by [`Self::finalize`].
    pub fn push_pending_assistant_text(&mut self, fragment: &str) {
        self.pending_assistant_text.push_str(fragment);
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty() && self.pending_assistant_text.trim().is_empty()
    }

    /// Finalization order (§4.3): (a) flush in-progress assistant text,
    /// (b) merge consecutive same-role turns, (c) insert into storage.
    /// Returns the new row id.
    pub async fn finalize(
        &mut self,
        persistence: &PersistenceClient,
        session_id: &str,
        tenant_id: &str,
        call_id: &str,
    ) -> Result<String, TranscriptError> {
        if !self.pending_assistant_text.trim().is_empty() {
            let text = std::mem::take(&mut self.pending_assistant_text);
            self.add_turn(Role::Assistant, &text);
        }

        merge_consecutive_same_role(&mut self.turns);

        let row = json!({
            "session_id": session_id,
            "tenant_id": tenant_id,
            "call_id": call_id,
            "transcript": json!({
                "session_id": session_id,
                "conversation": self.turns,
            }),
        });

        persistence
            .insert_call_detail(&row)
            .await
            .map_err(|e| TranscriptError::PersistFailed(e.to_string()))
    }

    /// Turns as they stand right now, without finalizing (used by the
    /// analyzer, §4.4 stage 4, to build the analysis prompt without first
    /// draining the manager).
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Render as `role: text` lines, the shape the analyzer prompt
    /// concatenates the transcript in (§4.4 stage 4).
    pub fn render_as_lines(&self) -> String {
        self.turns
            .iter()
            .map(|t| format!("{}: {}", role_label(t.role), t.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Merge adjacent same-role turns, concatenating with a single space.
/// Idempotent: applying it twice yields the same transcript (§8).
pub fn merge_consecutive_same_role(turns: &mut Vec<Turn>) {
    let mut merged: Vec<Turn> = Vec::with_capacity(turns.len());
    for turn in turns.drain(..) {
        match merged.last_mut() {
            Some(prev) if prev.role == turn.role => {
                prev.text.push(' ');
                prev.text.push_str(&turn.text);
            }
            _ => merged.push(turn),
        }
    }
    *turns = merged;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignores_empty_and_whitespace_only_turns() {
        let mut mgr = TranscriptManager::new();
        mgr.add_turn(Role::User, "  ");
        mgr.add_turn(Role::User, "");
        assert!(mgr.is_empty());
    }

    #[test]
    fn merge_is_idempotent() {
        let mut turns = vec![
            Turn { role: Role::User, text: "hi".into() },
            Turn { role: Role::User, text: "there".into() },
            Turn { role: Role::Assistant, text: "hello".into() },
        ];
        merge_consecutive_same_role(&mut turns);
        let once = turns.clone();
        merge_consecutive_same_role(&mut turns);
        assert_eq!(turns.len(), once.len());
        assert_eq!(turns[0].text, once[0].text);
    }

    #[test]
    fn merge_produces_alternating_roles() {
        let mut mgr = TranscriptManager::new();
        mgr.add_turn(Role::User, "a");
        mgr.add_turn(Role::User, "b");
        mgr.add_turn(Role::Assistant, "c");
        mgr.add_turn(Role::User, "d");
        let mut turns = mgr.turns().to_vec();
        merge_consecutive_same_role(&mut turns);
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].text, "a b");
        for pair in turns.windows(2) {
            assert_ne!(pair[0].role, pair[1].role);
        }
    }
}
