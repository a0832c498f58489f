use serde::Serialize;
use thiserror::Error;

/// Lifecycle of one launch invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Launching,
    Running,
    ShuttingDown,
    Terminated,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid supervisor transition: {0:?} -> {1:?}")]
    InvalidTransition(SupervisorState, SupervisorState),
}

pub struct StateMachine {
    state: SupervisorState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: SupervisorState::Idle }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn can_transition(&self, to: SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (self.state, to),
            (Idle, Launching)
                | (Launching, Running)
                // retry_failed() re-enters Launching from Running
                | (Running, Launching)
                | (Running, ShuttingDown)
                // shutdown with nothing launched
                | (Idle, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }

    pub fn transition(&mut self, to: SupervisorState) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::debug!("Supervisor transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_lifecycle() {
        let mut sm = StateMachine::new();
        assert_eq!(sm.state(), SupervisorState::Idle);
        assert!(sm.transition(SupervisorState::Launching).is_ok());
        assert!(sm.transition(SupervisorState::Running).is_ok());
        assert!(sm.transition(SupervisorState::ShuttingDown).is_ok());
        assert!(sm.transition(SupervisorState::Terminated).is_ok());
    }

    #[test]
    fn relaunch_from_running() {
        let mut sm = StateMachine::new();
        sm.transition(SupervisorState::Launching).unwrap();
        sm.transition(SupervisorState::Running).unwrap();
        assert!(sm.transition(SupervisorState::Launching).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        let mut sm = StateMachine::new();
        // cannot go directly from Idle -> Running
        assert_eq!(
            sm.transition(SupervisorState::Running),
            Err(TransitionError::InvalidTransition(SupervisorState::Idle, SupervisorState::Running))
        );

        sm.transition(SupervisorState::ShuttingDown).unwrap();
        sm.transition(SupervisorState::Terminated).unwrap();
        // terminated is final
        assert!(sm.transition(SupervisorState::Launching).is_err());
        assert!(sm.transition(SupervisorState::ShuttingDown).is_err());
    }
}
