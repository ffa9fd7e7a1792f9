//! Context assembly for the provider session.
//!
//! Builds the facts pack and per-user conversation context that gets
//! merged into the upstream session instructions: configured facts, the
//! returning-user flag, and the most recent cross-session summary. Also
//! produces the end-of-session summary rows that feed the next visit.

use crate::storage::{ConversationSummary, Role, SqlStore, UserRecord};
use anyhow::Result;
use std::sync::Arc;

/// Character budget for the instruction context block.
const CONTEXT_CHAR_BUDGET: usize = 1_200;

/// Turns folded into an end-of-session summary.
const SUMMARY_TURN_WINDOW: usize = 6;

/// Result of assembling context for a new session.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub user: Option<UserRecord>,
    pub is_returning_user: bool,
    pub previous_session_count: i64,
    /// Text block merged into the provider instructions.
    pub instructions_context: String,
}

/// Assembles facts and history into provider instructions.
pub struct ContextAssembler {
    store: Option<Arc<SqlStore>>,
    /// Facts pack: operator-approved statements about the deployment.
    facts: Vec<String>,
}

impl ContextAssembler {
    pub fn new(store: Option<Arc<SqlStore>>, facts: Vec<String>) -> Self {
        Self { store, facts }
    }

    /// Assemble context for a session keyed by browser fingerprint.
    /// Anonymous sessions get the facts pack only.
    pub fn assemble(&self, fingerprint: Option<&str>) -> Result<AssembledContext> {
        let mut sections: Vec<String> = Vec::new();

        if !self.facts.is_empty() {
            let mut block = String::from("Facts you may rely on:");
            for fact in &self.facts {
                block.push_str("\n- ");
                block.push_str(fact);
            }
            sections.push(block);
        }

        let mut user = None;
        let mut previous_session_count = 0;

        if let (Some(store), Some(fingerprint)) = (&self.store, fingerprint) {
            let record = store.upsert_user(fingerprint)?;
            previous_session_count = record.previous_session_count;

            if record.previous_session_count > 0 {
                sections.push(format!(
                    "This caller has spoken with you {} time(s) before.",
                    record.previous_session_count
                ));
                if let Some(summary) = store.latest_summary_for_user(&record.id)? {
                    sections.push(format!(
                        "Summary of the previous conversation: {}",
                        summary.summary
                    ));
                }
            }
            user = Some(record);
        }

        let mut instructions_context = sections.join("\n\n");
        if instructions_context.chars().count() > CONTEXT_CHAR_BUDGET {
            instructions_context = instructions_context
                .chars()
                .take(CONTEXT_CHAR_BUDGET)
                .collect();
        }

        Ok(AssembledContext {
            is_returning_user: previous_session_count > 0,
            previous_session_count,
            user,
            instructions_context,
        })
    }

    /// Fold the session's final transcripts into a summary row for the
    /// next visit. No-op for anonymous sessions or empty transcripts.
    pub fn summarize_session(&self, session_id: &str, user_id: Option<&str>) -> Result<()> {
        let (Some(store), Some(user_id)) = (&self.store, user_id) else {
            return Ok(());
        };

        let transcripts = store.transcripts_for_session(session_id)?;
        let finals: Vec<_> = transcripts.iter().filter(|t| t.is_final).collect();
        if finals.is_empty() {
            return Ok(());
        }

        let mut summary = String::new();
        for entry in finals.iter().rev().take(SUMMARY_TURN_WINDOW).rev() {
            if !summary.is_empty() {
                summary.push(' ');
            }
            let role = match entry.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::System => "System",
            };
            summary.push_str(&format!("{role}: {}", entry.content));
        }
        if summary.chars().count() > CONTEXT_CHAR_BUDGET {
            summary = summary.chars().take(CONTEXT_CHAR_BUDGET).collect();
        }

        store.insert_summary(&ConversationSummary {
            user_id: user_id.to_string(),
            from_session_id: session_id.to_string(),
            to_session_id: None,
            summary,
            turn_count: finals.len() as u32,
        })?;
        tracing::debug!(session_id = %session_id, turns = finals.len(), "Session summarized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TranscriptEntry;

    fn store() -> Arc<SqlStore> {
        Arc::new(SqlStore::open_in_memory().unwrap())
    }

    fn transcript(session: &str, role: Role, content: &str) -> TranscriptEntry {
        TranscriptEntry {
            session_id: session.into(),
            user_id: None,
            role,
            content: content.into(),
            confidence: 1.0,
            timestamp_ms: 0,
            is_final: true,
        }
    }

    #[test]
    fn anonymous_context_has_facts_only() {
        let assembler = ContextAssembler::new(None, vec!["We ship worldwide.".into()]);
        let ctx = assembler.assemble(None).unwrap();
        assert!(!ctx.is_returning_user);
        assert!(ctx.user.is_none());
        assert!(ctx.instructions_context.contains("We ship worldwide."));
    }

    #[test]
    fn first_visit_is_not_returning() {
        let assembler = ContextAssembler::new(Some(store()), vec![]);
        let ctx = assembler.assemble(Some("fp-1")).unwrap();
        assert!(!ctx.is_returning_user);
        assert_eq!(ctx.previous_session_count, 0);
        assert!(ctx.user.is_some());
    }

    #[test]
    fn returning_user_gets_summary_in_context() {
        let store = store();
        let user = store.upsert_user("fp-1").unwrap();
        store.insert_session("s1", Some(&user.id)).unwrap();
        store
            .insert_summary(&ConversationSummary {
                user_id: user.id.clone(),
                from_session_id: "s1".into(),
                to_session_id: None,
                summary: "Asked about the refund policy.".into(),
                turn_count: 2,
            })
            .unwrap();

        let assembler = ContextAssembler::new(Some(Arc::clone(&store)), vec![]);
        let ctx = assembler.assemble(Some("fp-1")).unwrap();
        assert!(ctx.is_returning_user);
        assert_eq!(ctx.previous_session_count, 1);
        assert!(ctx.instructions_context.contains("refund policy"));
    }

    #[test]
    fn summarize_session_folds_final_turns() {
        let store = store();
        let user = store.upsert_user("fp-1").unwrap();
        store.insert_session("s1", Some(&user.id)).unwrap();
        store
            .upsert_transcript(&transcript("s1", Role::User, "Do you ship to Japan?"))
            .unwrap();
        store
            .upsert_transcript(&transcript("s1", Role::Assistant, "Yes, within a week."))
            .unwrap();

        let assembler = ContextAssembler::new(Some(Arc::clone(&store)), vec![]);
        assembler.summarize_session("s1", Some(&user.id)).unwrap();

        let summary = store.latest_summary_for_user(&user.id).unwrap().unwrap();
        assert_eq!(summary.turn_count, 2);
        assert!(summary.summary.contains("Japan"));
        assert!(summary.summary.contains("Assistant:"));
    }

    #[test]
    fn summarize_skips_anonymous_and_empty() {
        let store = store();
        store.insert_session("s1", None).unwrap();
        let assembler = ContextAssembler::new(Some(Arc::clone(&store)), vec![]);
        // Anonymous
        assembler.summarize_session("s1", None).unwrap();
        // Named but no transcripts
        let user = store.upsert_user("fp-1").unwrap();
        assembler.summarize_session("s1", Some(&user.id)).unwrap();
        assert!(store.latest_summary_for_user(&user.id).unwrap().is_none());
    }

    #[test]
    fn context_respects_char_budget() {
        let facts = vec!["x".repeat(3_000)];
        let assembler = ContextAssembler::new(None, facts);
        let ctx = assembler.assemble(None).unwrap();
        assert!(ctx.instructions_context.chars().count() <= CONTEXT_CHAR_BUDGET);
    }
}
