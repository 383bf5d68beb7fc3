use crate::error::AppError;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum AppState {
    Initializing,
    Running,
    /// Streaming proceeds but startup buffering fell short of the target.
    Degraded { reason: String },
    Stopping,
    Stopped,
}

pub struct StateManager {
    state: Arc<RwLock<AppState>>,
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(AppState::Initializing)),
        }
    }

    pub fn transition(&self, new_state: AppState) -> Result<(), AppError> {
        let mut current = self.state.write();

        let valid = matches!(
            (&*current, &new_state),
            (AppState::Initializing, AppState::Running)
                | (AppState::Initializing, AppState::Degraded { .. })
                | (AppState::Initializing, AppState::Stopping)
                | (AppState::Running, AppState::Degraded { .. })
                | (AppState::Running, AppState::Stopping)
                | (AppState::Degraded { .. }, AppState::Running)
                | (AppState::Degraded { .. }, AppState::Stopping)
                | (AppState::Stopping, AppState::Stopped)
        );

        if !valid {
            return Err(AppError::Fatal(format!(
                "Invalid state transition: {:?} -> {:?}",
                *current, new_state
            )));
        }

        tracing::info!("State transition: {:?} -> {:?}", *current, new_state);
        *current = new_state;
        Ok(())
    }

    pub fn current(&self) -> AppState {
        self.state.read().clone()
    }
}
