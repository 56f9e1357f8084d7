//! Canary rollout state machine.
//!
//! The controller records the intended traffic fraction for the execution
//! engine to honor; it does not shed load itself. Its job is state
//! integrity: transitions are validated here, serialization across
//! concurrent control calls is the deployment manager's per-deployment
//! lock.

use crate::error::{Result, ServiceError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryPhase {
    Running,
    Paused,
    Canceled,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryAction {
    Advance,
    Pause,
    Resume,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanaryState {
    pub enabled: bool,
    pub stages: Vec<u8>,
    pub current_stage: usize,
    pub state: CanaryPhase,
    /// Set when an operator reported negative signal at any stage; decides
    /// whether a cancel ends the deployment as FAILED_CANARY or CANCELED.
    pub negative_signal: bool,
}

impl CanaryState {
    pub fn new(stages: Vec<u8>) -> Self {
        // A single stage has nowhere to advance to; it is complete on
        // arrival at its only traffic fraction.
        let state = if stages.len() <= 1 {
            CanaryPhase::Completed
        } else {
            CanaryPhase::Running
        };
        Self {
            enabled: true,
            stages,
            current_stage: 0,
            state,
            negative_signal: false,
        }
    }

    pub fn current_percent(&self) -> u8 {
        self.stages.get(self.current_stage).copied().unwrap_or(0)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, CanaryPhase::Canceled | CanaryPhase::Completed)
    }

    /// Moves one stage forward; completing happens on reaching the last one.
    pub fn advance(&mut self) -> Result<()> {
        self.ensure_state(CanaryPhase::Running, "advance")?;
        if self.current_stage + 1 >= self.stages.len() {
            return Err(ServiceError::InvalidRequest(
                "canary is already at its final stage".into(),
            ));
        }
        self.current_stage += 1;
        if self.current_stage + 1 == self.stages.len() {
            self.state = CanaryPhase::Completed;
        }
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.ensure_state(CanaryPhase::Running, "pause")?;
        self.state = CanaryPhase::Paused;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        self.ensure_state(CanaryPhase::Paused, "resume")?;
        self.state = CanaryPhase::Running;
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        match self.state {
            CanaryPhase::Running | CanaryPhase::Paused => {
                self.state = CanaryPhase::Canceled;
                Ok(())
            }
            _ => Err(ServiceError::InvalidRequest(format!(
                "cannot cancel a {:?} canary",
                self.state
            ))),
        }
    }

    pub fn record_signal(&mut self, healthy: bool) {
        if !healthy {
            self.negative_signal = true;
        }
    }

    fn ensure_state(&self, expected: CanaryPhase, action: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ServiceError::InvalidRequest(format!(
                "cannot {action} a {:?} canary",
                self.state
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn canary() -> CanaryState {
        CanaryState::new(vec![5, 25, 50, 100])
    }

    #[test]
    fn advance_walks_the_stages_and_completes() {
        let mut state = canary();
        assert_eq!(state.current_percent(), 5);

        state.advance().unwrap();
        assert_eq!(state.current_stage, 1);
        assert_eq!(state.state, CanaryPhase::Running);

        state.advance().unwrap();
        let stages_before = state.stages.clone();
        state.advance().unwrap();
        assert_eq!(state.state, CanaryPhase::Completed);
        assert_eq!(state.current_percent(), 100);
        assert_eq!(state.stages, stages_before);
    }

    #[test]
    fn advance_from_last_stage_is_rejected() {
        let mut state = canary();
        state.current_stage = 3;
        state.state = CanaryPhase::Completed;
        assert!(state.advance().is_err());

        // Even a still-running canary cannot advance past the end.
        let mut state = canary();
        state.current_stage = 3;
        assert!(state.advance().is_err());
        assert_eq!(state.current_stage, 3);
    }

    #[test]
    fn pause_resume_round_trip() {
        let mut state = canary();
        state.pause().unwrap();
        assert_eq!(state.state, CanaryPhase::Paused);
        assert!(state.advance().is_err());
        state.resume().unwrap();
        assert_eq!(state.state, CanaryPhase::Running);
        assert!(state.pause().is_ok());
    }

    #[test]
    fn cancel_is_valid_from_running_and_paused_only() {
        let mut state = canary();
        state.cancel().unwrap();
        assert_eq!(state.state, CanaryPhase::Canceled);
        assert!(state.cancel().is_err());

        let mut state = canary();
        state.pause().unwrap();
        assert!(state.cancel().is_ok());
    }

    #[test]
    fn single_stage_canary_completes_on_creation() {
        let mut state = CanaryState::new(vec![100]);
        assert_eq!(state.state, CanaryPhase::Completed);
        assert!(state.is_terminal());
        assert_eq!(state.current_percent(), 100);
        assert!(state.advance().is_err());
        assert!(state.pause().is_err());
    }

    #[test]
    fn negative_signal_sticks() {
        let mut state = canary();
        state.record_signal(true);
        assert!(!state.negative_signal);
        state.record_signal(false);
        state.record_signal(true);
        assert!(state.negative_signal);
    }
}
