//! Lane C: the policy pipeline and override controller.
//!
//! Every finalized utterance (user or assistant) runs through the fixed
//! pipeline PII → moderation → claims. Each check produces an independent
//! candidate decision; the most severe wins, ties resolving to the earlier
//! check. The override controller then upgrades qualifying refusals to
//! `cancel_output`, which the arbitrator turns into a fallback playback.
//!
//! Every evaluation emits `policy.decision` and `control.audit` on the
//! bus; session-scoped metrics flush as `control.metrics`.

pub mod claims;
pub mod moderation;
pub mod pii;

use crate::bus::{event_type, Event, EventBus, EventSource};
use crate::clock::SharedClock;
use crate::config::{FallbackMode, PiiMode, PolicyConfig};
use crate::storage::Role;
use claims::ClaimsRegistry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Snippet length cap on audit events.
const AUDIT_SNIPPET_CHARS: usize = 200;

/// Pipeline verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Rewrite,
    Refuse,
    Escalate,
    CancelOutput,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Rewrite => "rewrite",
            Self::Refuse => "refuse",
            Self::Escalate => "escalate",
            Self::CancelOutput => "cancel_output",
        }
    }
}

/// Full decision record emitted as `policy.decision`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub decision: Decision,
    pub reason_codes: Vec<String>,
    pub severity: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_rewrite: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_disclaimer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_mode: Option<FallbackMode>,
    pub checks_run: Vec<String>,
}

impl PolicyDecision {
    fn allow(checks_run: Vec<String>) -> Self {
        Self {
            decision: Decision::Allow,
            reason_codes: Vec::new(),
            severity: 0,
            safe_rewrite: None,
            required_disclaimer_id: None,
            fallback_mode: None,
            checks_run,
        }
    }
}

/// Session-scoped evaluation metrics, flushed as `control.metrics`.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMetrics {
    pub evaluation_count: u64,
    pub allow_count: u64,
    pub rewrite_count: u64,
    pub refuse_count: u64,
    pub escalate_count: u64,
    pub cancel_output_count: u64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: f64,
}

impl PolicyMetrics {
    fn record(&mut self, decision: Decision, duration_ms: f64) {
        self.evaluation_count += 1;
        match decision {
            Decision::Allow => self.allow_count += 1,
            Decision::Rewrite => self.rewrite_count += 1,
            Decision::Refuse => self.refuse_count += 1,
            Decision::Escalate => self.escalate_count += 1,
            Decision::CancelOutput => self.cancel_output_count += 1,
        }
        let prev_total = self.avg_duration_ms * (self.evaluation_count - 1) as f64;
        self.avg_duration_ms = (prev_total + duration_ms) / self.evaluation_count as f64;
        if duration_ms > self.max_duration_ms {
            self.max_duration_ms = duration_ms;
        }
    }
}

/// Lane C engine for one session.
pub struct PolicyEngine {
    config: PolicyConfig,
    claims: ClaimsRegistry,
    bus: Arc<EventBus>,
    clock: SharedClock,
    session_id: String,
    metrics: Mutex<PolicyMetrics>,
    pending_response_metadata: Mutex<Option<Value>>,
}

impl PolicyEngine {
    pub fn new(
        config: PolicyConfig,
        bus: Arc<EventBus>,
        clock: SharedClock,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            config,
            claims: ClaimsRegistry::default(),
            bus,
            clock,
            session_id: session_id.into(),
            metrics: Mutex::new(PolicyMetrics::default()),
            pending_response_metadata: Mutex::new(None),
        }
    }

    pub fn with_claims(mut self, registry: ClaimsRegistry) -> Self {
        self.claims = registry;
        self
    }

    pub fn evaluate_deltas(&self) -> bool {
        self.config.evaluate_deltas
    }

    /// Store upstream response metadata; attached to the next assistant
    /// evaluation's audit context.
    pub fn set_response_metadata(&self, metadata: Value) {
        *self.pending_response_metadata.lock() = Some(metadata);
    }

    /// Run the pipeline without emitting anything. Pure decision logic.
    pub fn evaluate(&self, role: Role, text: &str) -> PolicyDecision {
        let mut checks_run = Vec::new();
        let mut candidates: Vec<PolicyDecision> = Vec::new();

        // 1. PII
        if self.config.enable_pii_redaction {
            checks_run.push("pii".to_string());
            let matches = pii::detect(text);
            if !matches.is_empty() {
                let mut reason_codes = vec!["PII_DETECTED".to_string()];
                for m in &matches {
                    let code = format!("PII:{}", m.kind.as_str());
                    if !reason_codes.contains(&code) {
                        reason_codes.push(code);
                    }
                }
                let (decision, safe_rewrite) = match self.config.pii_redaction_mode {
                    PiiMode::Redact => {
                        (Decision::Rewrite, Some(pii::redact(text, &matches)))
                    }
                    PiiMode::Flag => (Decision::Allow, None),
                };
                candidates.push(PolicyDecision {
                    decision,
                    reason_codes,
                    severity: 1,
                    safe_rewrite,
                    required_disclaimer_id: None,
                    fallback_mode: None,
                    checks_run: Vec::new(),
                });
            }
        }

        // 2. Moderation
        checks_run.push("moderation".to_string());
        if let Some(hit) = moderation::moderate(text, &self.config.moderation_categories) {
            candidates.push(PolicyDecision {
                decision: hit.decision,
                reason_codes: vec![
                    "MODERATION_VIOLATION".to_string(),
                    format!("MODERATION:{}", hit.category),
                ],
                severity: hit.severity,
                safe_rewrite: None,
                required_disclaimer_id: None,
                fallback_mode: None,
                checks_run: Vec::new(),
            });
        }

        // 3. Claims (assistant output only)
        if role == Role::Assistant {
            checks_run.push("claims".to_string());
            if let Some(hit) = self.claims.check(text) {
                candidates.push(PolicyDecision {
                    decision: Decision::Rewrite,
                    reason_codes: vec![claims::REASON_DISALLOWED.to_string()],
                    severity: 2,
                    safe_rewrite: Some(hit.safe_rewrite),
                    required_disclaimer_id: None,
                    fallback_mode: None,
                    checks_run: Vec::new(),
                });
            }
        }

        // Severity-max wins; earlier pipeline position breaks ties.
        let mut winner = match candidates.into_iter().reduce(|best, candidate| {
            if candidate.severity > best.severity {
                candidate
            } else {
                best
            }
        }) {
            Some(decision) => decision,
            None => PolicyDecision::allow(checks_run.clone()),
        };
        winner.checks_run = checks_run;

        self.apply_override(winner)
    }

    /// Override controller: a refusal at or above the threshold becomes a
    /// cancel of in-flight output.
    fn apply_override(&self, mut decision: PolicyDecision) -> PolicyDecision {
        if decision.decision == Decision::Refuse
            && decision.severity >= self.config.cancel_output_threshold
        {
            decision.decision = Decision::CancelOutput;
            decision.fallback_mode = Some(FallbackMode::RefusePolitely);
        }
        decision
    }

    /// Run the pipeline, emit `policy.decision` / `control.audit` (and
    /// `control.override` when an upgrade happened), record metrics.
    pub fn evaluate_and_emit(&self, role: Role, text: &str) -> PolicyDecision {
        let started = std::time::Instant::now();
        let decision = self.evaluate(role, text);
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        self.metrics.lock().record(decision.decision, duration_ms);

        let overridden = decision.decision == Decision::CancelOutput;
        if overridden {
            self.emit(
                event_type::CONTROL_OVERRIDE,
                json!({
                    "originalDecision": Decision::Refuse.as_str(),
                    "effectiveDecision": Decision::CancelOutput.as_str(),
                    "severity": decision.severity,
                }),
            );
            tracing::warn!(
                session_id = %self.session_id,
                severity = decision.severity,
                "Policy override: refuse upgraded to cancel_output"
            );
        }

        self.emit(
            event_type::POLICY_DECISION,
            serde_json::to_value(&decision).unwrap_or(Value::Null),
        );

        let snippet: String = pii::redact_text(text)
            .chars()
            .take(AUDIT_SNIPPET_CHARS)
            .collect();
        let mut audit = json!({
            "role": role.as_str(),
            "textSnippet": snippet,
            "decision": decision.decision.as_str(),
            "severity": decision.severity,
            "checksRun": decision.checks_run,
        });
        if role == Role::Assistant {
            if let Some(metadata) = self.pending_response_metadata.lock().take() {
                audit["responseMetadata"] = metadata;
            }
        }
        self.emit(event_type::CONTROL_AUDIT, audit);

        decision
    }

    /// Emit the accumulated metrics as `control.metrics`.
    pub fn flush_metrics(&self) {
        let snapshot = self.metrics.lock().clone();
        self.emit(
            event_type::CONTROL_METRICS,
            serde_json::to_value(&snapshot).unwrap_or(Value::Null),
        );
    }

    pub fn metrics(&self) -> PolicyMetrics {
        self.metrics.lock().clone()
    }

    fn emit(&self, kind: &str, payload: Value) {
        self.bus.emit(Event::new(
            self.session_id.clone(),
            EventSource::LaneC,
            kind,
            payload,
            &self.clock,
        ));
    }
}
