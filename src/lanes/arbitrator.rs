//! Lane arbitration state machine.
//!
//! Decides who owns the speaker at each instant: the reflex lane (A), the
//! primary response lane (B), or the fallback player. The machine itself
//! is pure — `handle` maps an input event to a list of actions — and the
//! session runtime interprets the actions (emitting lane commands, arming
//! and cancelling timers). That split keeps every transition in the table
//! testable with no clocks or tasks.
//!
//! ```text
//! IDLE ─start─▸ LISTENING ─speech_end─▸ B_RESPONDING ─reflex timer─▸ A_PLAYING
//!                   ▴                        │  ▴                        │
//!                   │                 first_audio  max-reflex      first_audio
//!                   │                        ▾  │                     (gap)
//!                   └──────lane_b_done── B_PLAYING ◂──────────────────┘
//! ```

use crate::config::ArbitratorConfig;
use serde::Serialize;
use std::collections::VecDeque;

/// Arbitration states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LaneState {
    Idle,
    Listening,
    BResponding,
    APlaying,
    BPlaying,
    FallbackPlaying,
    Ended,
}

impl LaneState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Listening => "LISTENING",
            Self::BResponding => "B_RESPONDING",
            Self::APlaying => "A_PLAYING",
            Self::BPlaying => "B_PLAYING",
            Self::FallbackPlaying => "FALLBACK_PLAYING",
            Self::Ended => "ENDED",
        }
    }
}

/// Current audio owner. Never more than one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Owner {
    None,
    A,
    B,
    Fallback,
}

impl Owner {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::A => "A",
            Self::B => "B",
            Self::Fallback => "fallback",
        }
    }
}

/// Timers owned by the interpreter on the arbitrator's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Delay between speech end and the reflex firing.
    Reflex,
    /// Cap on reflex playback duration.
    MaxReflex,
    /// Gap between stopping one owner and starting the next.
    TransitionGap,
}

/// Input events to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterEvent {
    StartSession,
    UserSpeechEnded,
    TimerFired(TimerKind),
    LaneBFirstAudioReady,
    LaneBDone,
    UserBargeIn,
    PolicyCancelOutput,
    FallbackDone,
    EndSession,
    /// Clears the guard after a rejected commit so the user can retry.
    ResetResponseInProgress,
}

impl ArbiterEvent {
    /// Cause tag attached to `lane.state_changed` events.
    pub fn cause(&self) -> &'static str {
        match self {
            Self::StartSession => "start_session",
            Self::UserSpeechEnded => "user_speech_ended",
            Self::TimerFired(TimerKind::Reflex) => "reflex_timer",
            Self::TimerFired(TimerKind::MaxReflex) => "max_reflex_timer",
            Self::TimerFired(TimerKind::TransitionGap) => "transition_gap",
            Self::LaneBFirstAudioReady => "lane_b_first_audio_ready",
            Self::LaneBDone => "lane_b_done",
            Self::UserBargeIn => "user_barge_in",
            Self::PolicyCancelOutput => "policy_cancel_output",
            Self::FallbackDone => "fallback_done",
            Self::EndSession => "end_session",
            Self::ResetResponseInProgress => "reset_response_in_progress",
        }
    }
}

/// Actions the interpreter carries out, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ArbiterAction {
    PlayReflex,
    StopReflex,
    PlayLaneB,
    StopLaneB,
    PlayFallback,
    StopFallback,
    /// Exactly once per user turn.
    ResponseComplete,
    ArmTimer(TimerKind, u64),
    CancelTimer(TimerKind),
    CancelAllTimers,
    StateChanged {
        from: LaneState,
        to: LaneState,
        cause: &'static str,
    },
    OwnerChanged {
        from: Owner,
        to: Owner,
        cause: &'static str,
    },
}

/// One row of the bounded transition history.
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: LaneState,
    pub to: LaneState,
    pub cause: &'static str,
    pub t_ms: u64,
}

const HISTORY_CAP: usize = 64;

/// The arbitration record for one session.
pub struct LaneArbitrator {
    config: ArbitratorConfig,
    state: LaneState,
    owner: Owner,
    response_in_progress: bool,
    /// Lane B became ready while the reflex is playing; waiting out the gap.
    pending_b_handoff: bool,
    speech_end_ms: Option<u64>,
    b_first_ready_ms: Option<u64>,
    history: VecDeque<Transition>,
}

impl LaneArbitrator {
    pub fn new(config: ArbitratorConfig) -> Self {
        Self {
            config,
            state: LaneState::Idle,
            owner: Owner::None,
            response_in_progress: false,
            pending_b_handoff: false,
            speech_end_ms: None,
            b_first_ready_ms: None,
            history: VecDeque::new(),
        }
    }

    pub fn state(&self) -> LaneState {
        self.state
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn response_in_progress(&self) -> bool {
        self.response_in_progress
    }

    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    pub fn speech_end_ms(&self) -> Option<u64> {
        self.speech_end_ms
    }

    pub fn b_first_ready_ms(&self) -> Option<u64> {
        self.b_first_ready_ms
    }

    fn transition(
        &mut self,
        to: LaneState,
        cause: &'static str,
        now_ms: u64,
        actions: &mut Vec<ArbiterAction>,
    ) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        if self.history.len() == HISTORY_CAP {
            self.history.pop_front();
        }
        self.history.push_back(Transition {
            from,
            to,
            cause,
            t_ms: now_ms,
        });
        actions.push(ArbiterAction::StateChanged { from, to, cause });
    }

    fn set_owner(&mut self, to: Owner, cause: &'static str, actions: &mut Vec<ArbiterAction>) {
        let from = self.owner;
        if from == to {
            return;
        }
        self.owner = to;
        actions.push(ArbiterAction::OwnerChanged { from, to, cause });
    }

    /// Emit the stop command for whoever currently owns the speaker.
    fn stop_current_owner(&self, actions: &mut Vec<ArbiterAction>) {
        match self.owner {
            Owner::A => actions.push(ArbiterAction::StopReflex),
            Owner::B => actions.push(ArbiterAction::StopLaneB),
            Owner::Fallback => actions.push(ArbiterAction::StopFallback),
            Owner::None => {}
        }
    }

    /// Apply one event. Returns the actions for the interpreter, in order.
    pub fn handle(&mut self, event: ArbiterEvent, now_ms: u64) -> Vec<ArbiterAction> {
        let mut actions = Vec::new();
        let cause = event.cause();

        if self.state == LaneState::Ended {
            // ENDED is terminal; nothing resets it.
            return actions;
        }

        match event {
            ArbiterEvent::StartSession => {
                if self.state == LaneState::Idle {
                    self.transition(LaneState::Listening, cause, now_ms, &mut actions);
                }
            }

            ArbiterEvent::UserSpeechEnded => {
                if self.state != LaneState::Listening {
                    return actions;
                }
                if self.response_in_progress {
                    // Second turn-end while a response is still owed; the
                    // guard makes it a no-op.
                    tracing::debug!("user_speech_ended ignored: response in progress");
                    return actions;
                }
                self.response_in_progress = true;
                self.speech_end_ms = Some(now_ms);
                self.b_first_ready_ms = None;
                self.pending_b_handoff = false;
                actions.push(ArbiterAction::ArmTimer(
                    TimerKind::Reflex,
                    self.config.min_delay_before_reflex_ms,
                ));
                self.transition(LaneState::BResponding, cause, now_ms, &mut actions);
            }

            ArbiterEvent::TimerFired(TimerKind::Reflex) => {
                if self.state != LaneState::BResponding || !self.config.lane_a_enabled {
                    return actions;
                }
                actions.push(ArbiterAction::PlayReflex);
                actions.push(ArbiterAction::ArmTimer(
                    TimerKind::MaxReflex,
                    self.config.max_reflex_duration_ms,
                ));
                self.transition(LaneState::APlaying, cause, now_ms, &mut actions);
                self.set_owner(Owner::A, cause, &mut actions);
            }

            ArbiterEvent::TimerFired(TimerKind::MaxReflex) => {
                if self.state != LaneState::APlaying {
                    return actions;
                }
                actions.push(ArbiterAction::StopReflex);
                self.transition(LaneState::BResponding, cause, now_ms, &mut actions);
                self.set_owner(Owner::None, cause, &mut actions);
            }

            ArbiterEvent::LaneBFirstAudioReady => match self.state {
                LaneState::BResponding => {
                    // Lane B beat the reflex; no reflex is played at all.
                    self.b_first_ready_ms = Some(now_ms);
                    actions.push(ArbiterAction::CancelTimer(TimerKind::Reflex));
                    actions.push(ArbiterAction::PlayLaneB);
                    self.transition(LaneState::BPlaying, cause, now_ms, &mut actions);
                    self.set_owner(Owner::B, cause, &mut actions);
                }
                LaneState::APlaying => {
                    if self.pending_b_handoff {
                        // Duplicate ready; handoff already scheduled.
                        return actions;
                    }
                    self.b_first_ready_ms = Some(now_ms);
                    self.pending_b_handoff = true;
                    actions.push(ArbiterAction::ArmTimer(
                        TimerKind::TransitionGap,
                        self.config.transition_gap_ms,
                    ));
                }
                // Duplicate ready in B_PLAYING (or any other state) is
                // idempotent.
                _ => {}
            },

            ArbiterEvent::TimerFired(TimerKind::TransitionGap) => {
                if self.state != LaneState::APlaying || !self.pending_b_handoff {
                    return actions;
                }
                self.pending_b_handoff = false;
                actions.push(ArbiterAction::StopReflex);
                actions.push(ArbiterAction::CancelTimer(TimerKind::MaxReflex));
                actions.push(ArbiterAction::PlayLaneB);
                self.transition(LaneState::BPlaying, cause, now_ms, &mut actions);
                self.set_owner(Owner::B, cause, &mut actions);
            }

            ArbiterEvent::LaneBDone => match self.state {
                LaneState::BPlaying | LaneState::BResponding | LaneState::APlaying => {
                    if self.state == LaneState::APlaying {
                        actions.push(ArbiterAction::StopReflex);
                    }
                    self.pending_b_handoff = false;
                    self.response_in_progress = false;
                    actions.push(ArbiterAction::CancelAllTimers);
                    actions.push(ArbiterAction::ResponseComplete);
                    self.transition(LaneState::Listening, cause, now_ms, &mut actions);
                    self.set_owner(Owner::None, cause, &mut actions);
                }
                _ => {
                    // Unexpected state: clear the guard and report, but do
                    // not disturb the current state.
                    tracing::debug!(state = self.state.as_str(), "lane_b_done in unexpected state");
                    self.response_in_progress = false;
                    actions.push(ArbiterAction::ResponseComplete);
                }
            },

            ArbiterEvent::UserBargeIn => {
                self.stop_current_owner(&mut actions);
                self.pending_b_handoff = false;
                self.response_in_progress = false;
                actions.push(ArbiterAction::CancelAllTimers);
                self.transition(LaneState::Listening, cause, now_ms, &mut actions);
                self.set_owner(Owner::None, cause, &mut actions);
            }

            ArbiterEvent::PolicyCancelOutput => {
                self.stop_current_owner(&mut actions);
                self.pending_b_handoff = false;
                actions.push(ArbiterAction::CancelAllTimers);
                actions.push(ArbiterAction::PlayFallback);
                self.transition(LaneState::FallbackPlaying, cause, now_ms, &mut actions);
                self.set_owner(Owner::Fallback, cause, &mut actions);
            }

            ArbiterEvent::FallbackDone => {
                if self.state != LaneState::FallbackPlaying {
                    return actions;
                }
                self.response_in_progress = false;
                self.transition(LaneState::Listening, cause, now_ms, &mut actions);
                self.set_owner(Owner::None, cause, &mut actions);
            }

            ArbiterEvent::EndSession => {
                self.stop_current_owner(&mut actions);
                actions.push(ArbiterAction::CancelAllTimers);
                self.transition(LaneState::Ended, cause, now_ms, &mut actions);
                self.set_owner(Owner::None, cause, &mut actions);
            }

            ArbiterEvent::ResetResponseInProgress => {
                self.response_in_progress = false;
                match self.state {
                    LaneState::BResponding => {
                        actions.push(ArbiterAction::CancelAllTimers);
                        self.transition(LaneState::Listening, cause, now_ms, &mut actions);
                    }
                    LaneState::APlaying => {
                        actions.push(ArbiterAction::StopReflex);
                        actions.push(ArbiterAction::CancelAllTimers);
                        self.transition(LaneState::Listening, cause, now_ms, &mut actions);
                        self.set_owner(Owner::None, cause, &mut actions);
                    }
                    _ => {}
                }
            }
        }

        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arb() -> LaneArbitrator {
        LaneArbitrator::new(ArbitratorConfig::default())
    }

    fn started() -> LaneArbitrator {
        let mut a = arb();
        a.handle(ArbiterEvent::StartSession, 0);
        a
    }

    fn to_b_responding(a: &mut LaneArbitrator, now: u64) {
        a.handle(ArbiterEvent::UserSpeechEnded, now);
        assert_eq!(a.state(), LaneState::BResponding);
    }

    fn has(actions: &[ArbiterAction], wanted: &ArbiterAction) -> bool {
        actions.iter().any(|a| a == wanted)
    }

    #[test]
    fn start_session_enters_listening() {
        let mut a = arb();
        let actions = a.handle(ArbiterEvent::StartSession, 0);
        assert_eq!(a.state(), LaneState::Listening);
        assert!(has(
            &actions,
            &ArbiterAction::StateChanged {
                from: LaneState::Idle,
                to: LaneState::Listening,
                cause: "start_session",
            }
        ));
    }

    #[test]
    fn speech_end_sets_guard_and_arms_reflex() {
        let mut a = started();
        let actions = a.handle(ArbiterEvent::UserSpeechEnded, 100);
        assert_eq!(a.state(), LaneState::BResponding);
        assert!(a.response_in_progress());
        assert_eq!(a.speech_end_ms(), Some(100));
        assert!(has(&actions, &ArbiterAction::ArmTimer(TimerKind::Reflex, 100)));
    }

    #[test]
    fn second_speech_end_is_ignored_while_guard_set() {
        let mut a = started();
        to_b_responding(&mut a, 100);
        // Back in LISTENING is required for speech end to even apply; here
        // the state has moved on, so this is doubly a no-op.
        let actions = a.handle(ArbiterEvent::UserSpeechEnded, 200);
        assert!(actions.is_empty());
        assert_eq!(a.state(), LaneState::BResponding);
    }

    #[test]
    fn reflex_timer_starts_lane_a() {
        let mut a = started();
        to_b_responding(&mut a, 100);
        let actions = a.handle(ArbiterEvent::TimerFired(TimerKind::Reflex), 200);
        assert_eq!(a.state(), LaneState::APlaying);
        assert_eq!(a.owner(), Owner::A);
        assert!(has(&actions, &ArbiterAction::PlayReflex));
        assert!(has(&actions, &ArbiterAction::ArmTimer(TimerKind::MaxReflex, 2000)));
    }

    #[test]
    fn reflex_timer_is_noop_when_lane_a_disabled() {
        let mut a = LaneArbitrator::new(ArbitratorConfig {
            lane_a_enabled: false,
            ..ArbitratorConfig::default()
        });
        a.handle(ArbiterEvent::StartSession, 0);
        to_b_responding(&mut a, 100);
        let actions = a.handle(ArbiterEvent::TimerFired(TimerKind::Reflex), 200);
        assert!(actions.is_empty());
        assert_eq!(a.state(), LaneState::BResponding);
    }

    #[test]
    fn lane_b_ready_before_reflex_skips_reflex() {
        let mut a = started();
        to_b_responding(&mut a, 100);
        let actions = a.handle(ArbiterEvent::LaneBFirstAudioReady, 150);
        assert_eq!(a.state(), LaneState::BPlaying);
        assert_eq!(a.owner(), Owner::B);
        assert!(has(&actions, &ArbiterAction::CancelTimer(TimerKind::Reflex)));
        assert!(has(&actions, &ArbiterAction::PlayLaneB));
        assert!(!has(&actions, &ArbiterAction::PlayReflex));
    }

    #[test]
    fn lane_b_preempts_reflex_after_gap() {
        let mut a = started();
        to_b_responding(&mut a, 100);
        a.handle(ArbiterEvent::TimerFired(TimerKind::Reflex), 200);
        assert_eq!(a.state(), LaneState::APlaying);

        // B ready: only the gap timer is armed, nothing stops yet.
        let actions = a.handle(ArbiterEvent::LaneBFirstAudioReady, 400);
        assert_eq!(a.state(), LaneState::APlaying);
        assert!(has(
            &actions,
            &ArbiterAction::ArmTimer(TimerKind::TransitionGap, 10)
        ));
        assert!(!has(&actions, &ArbiterAction::StopReflex));

        // Gap elapses: stop reflex, then hand the speaker to B.
        let actions = a.handle(ArbiterEvent::TimerFired(TimerKind::TransitionGap), 410);
        assert_eq!(a.state(), LaneState::BPlaying);
        assert_eq!(a.owner(), Owner::B);
        let stop_pos = actions
            .iter()
            .position(|x| *x == ArbiterAction::StopReflex)
            .unwrap();
        let play_pos = actions
            .iter()
            .position(|x| *x == ArbiterAction::PlayLaneB)
            .unwrap();
        assert!(stop_pos < play_pos);
    }

    #[test]
    fn duplicate_lane_b_ready_is_idempotent() {
        let mut a = started();
        to_b_responding(&mut a, 100);
        a.handle(ArbiterEvent::TimerFired(TimerKind::Reflex), 200);
        a.handle(ArbiterEvent::LaneBFirstAudioReady, 400);
        let actions = a.handle(ArbiterEvent::LaneBFirstAudioReady, 401);
        assert!(actions.is_empty());

        // And again once already in B_PLAYING.
        a.handle(ArbiterEvent::TimerFired(TimerKind::TransitionGap), 410);
        let actions = a.handle(ArbiterEvent::LaneBFirstAudioReady, 420);
        assert!(actions.is_empty());
    }

    #[test]
    fn max_reflex_timer_stops_reflex_and_keeps_waiting() {
        let mut a = started();
        to_b_responding(&mut a, 100);
        a.handle(ArbiterEvent::TimerFired(TimerKind::Reflex), 200);
        let actions = a.handle(ArbiterEvent::TimerFired(TimerKind::MaxReflex), 2200);
        assert_eq!(a.state(), LaneState::BResponding);
        assert_eq!(a.owner(), Owner::None);
        assert!(has(&actions, &ArbiterAction::StopReflex));
        assert!(a.response_in_progress());
    }

    #[test]
    fn lane_b_done_from_b_playing_completes_turn() {
        let mut a = started();
        to_b_responding(&mut a, 100);
        a.handle(ArbiterEvent::LaneBFirstAudioReady, 150);
        let actions = a.handle(ArbiterEvent::LaneBDone, 500);
        assert_eq!(a.state(), LaneState::Listening);
        assert_eq!(a.owner(), Owner::None);
        assert!(!a.response_in_progress());
        assert!(has(&actions, &ArbiterAction::ResponseComplete));
    }

    #[test]
    fn lane_b_done_before_first_audio_completes_turn() {
        let mut a = started();
        to_b_responding(&mut a, 100);
        let actions = a.handle(ArbiterEvent::LaneBDone, 150);
        assert_eq!(a.state(), LaneState::Listening);
        assert!(has(&actions, &ArbiterAction::ResponseComplete));
    }

    #[test]
    fn lane_b_done_during_reflex_stops_reflex() {
        let mut a = started();
        to_b_responding(&mut a, 100);
        a.handle(ArbiterEvent::TimerFired(TimerKind::Reflex), 200);
        let actions = a.handle(ArbiterEvent::LaneBDone, 300);
        assert_eq!(a.state(), LaneState::Listening);
        assert!(has(&actions, &ArbiterAction::StopReflex));
        assert!(has(&actions, &ArbiterAction::ResponseComplete));
    }

    #[test]
    fn lane_b_done_in_unexpected_state_is_defensive() {
        let mut a = started();
        let actions = a.handle(ArbiterEvent::LaneBDone, 100);
        assert_eq!(a.state(), LaneState::Listening);
        assert!(has(&actions, &ArbiterAction::ResponseComplete));
        assert!(!a.response_in_progress());
    }

    #[test]
    fn lane_b_done_does_not_resurrect_ended() {
        let mut a = started();
        a.handle(ArbiterEvent::EndSession, 100);
        let actions = a.handle(ArbiterEvent::LaneBDone, 200);
        assert!(actions.is_empty());
        assert_eq!(a.state(), LaneState::Ended);
    }

    #[test]
    fn barge_in_during_b_playing_returns_to_listening() {
        let mut a = started();
        to_b_responding(&mut a, 100);
        a.handle(ArbiterEvent::LaneBFirstAudioReady, 150);
        let actions = a.handle(ArbiterEvent::UserBargeIn, 300);
        assert_eq!(a.state(), LaneState::Listening);
        assert_eq!(a.owner(), Owner::None);
        assert!(!a.response_in_progress());
        assert!(has(&actions, &ArbiterAction::StopLaneB));
        assert!(has(&actions, &ArbiterAction::CancelAllTimers));
    }

    #[test]
    fn barge_in_during_reflex_stops_reflex() {
        let mut a = started();
        to_b_responding(&mut a, 100);
        a.handle(ArbiterEvent::TimerFired(TimerKind::Reflex), 200);
        let actions = a.handle(ArbiterEvent::UserBargeIn, 250);
        assert_eq!(a.state(), LaneState::Listening);
        assert!(has(&actions, &ArbiterAction::StopReflex));
    }

    #[test]
    fn policy_cancel_forces_fallback_then_listening() {
        let mut a = started();
        to_b_responding(&mut a, 100);
        a.handle(ArbiterEvent::LaneBFirstAudioReady, 150);

        let actions = a.handle(ArbiterEvent::PolicyCancelOutput, 300);
        assert_eq!(a.state(), LaneState::FallbackPlaying);
        assert_eq!(a.owner(), Owner::Fallback);
        assert!(has(&actions, &ArbiterAction::StopLaneB));
        assert!(has(&actions, &ArbiterAction::PlayFallback));

        let actions = a.handle(ArbiterEvent::FallbackDone, 900);
        assert_eq!(a.state(), LaneState::Listening);
        assert_eq!(a.owner(), Owner::None);
        assert!(!a.response_in_progress());
        assert!(has(
            &actions,
            &ArbiterAction::OwnerChanged {
                from: Owner::Fallback,
                to: Owner::None,
                cause: "fallback_done",
            }
        ));
    }

    #[test]
    fn end_session_cancels_everything() {
        let mut a = started();
        to_b_responding(&mut a, 100);
        a.handle(ArbiterEvent::TimerFired(TimerKind::Reflex), 200);
        let actions = a.handle(ArbiterEvent::EndSession, 300);
        assert_eq!(a.state(), LaneState::Ended);
        assert!(has(&actions, &ArbiterAction::CancelAllTimers));
        assert!(has(&actions, &ArbiterAction::StopReflex));

        // Terminal: everything after is a no-op.
        assert!(a.handle(ArbiterEvent::StartSession, 400).is_empty());
        assert!(a.handle(ArbiterEvent::UserBargeIn, 400).is_empty());
    }

    #[test]
    fn reset_response_in_progress_reopens_listening() {
        let mut a = started();
        to_b_responding(&mut a, 100);
        let actions = a.handle(ArbiterEvent::ResetResponseInProgress, 150);
        assert_eq!(a.state(), LaneState::Listening);
        assert!(!a.response_in_progress());
        assert!(has(&actions, &ArbiterAction::CancelAllTimers));

        // The user can immediately start another turn.
        let actions = a.handle(ArbiterEvent::UserSpeechEnded, 200);
        assert_eq!(a.state(), LaneState::BResponding);
        assert!(!actions.is_empty());
    }

    #[test]
    fn history_records_transitions_bounded() {
        let mut a = started();
        for i in 0..100u64 {
            a.handle(ArbiterEvent::UserSpeechEnded, i * 10);
            a.handle(ArbiterEvent::LaneBDone, i * 10 + 5);
        }
        let count = a.history().count();
        assert_eq!(count, HISTORY_CAP);
        let last = a.history().last().unwrap();
        assert_eq!(last.to, LaneState::Listening);
    }

    #[test]
    fn reflex_fires_at_exact_min_delay_when_b_not_ready() {
        // The interpreter fires the timer exactly at min_delay; the machine
        // accepts it as long as B has not taken over.
        let mut a = started();
        a.handle(ArbiterEvent::UserSpeechEnded, 1_000);
        let actions = a.handle(ArbiterEvent::TimerFired(TimerKind::Reflex), 1_100);
        assert_eq!(a.state(), LaneState::APlaying);
        assert!(has(&actions, &ArbiterAction::PlayReflex));
    }
}
