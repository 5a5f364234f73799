use std::fmt::Display;

/// Externally observable controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Initial login or subscription in progress.
    SettingUp,
    /// Credential held and, if requested, the stream is being served.
    Active,
    /// Session lost; tearing down and re-authenticating.
    Reauthenticating,
    /// Initial setup failed. Terminal.
    Failed,
    /// Explicitly stopped. Terminal.
    Stopped,
}

impl Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkState::SettingUp => "setting-up",
            LinkState::Active => "active",
            LinkState::Reauthenticating => "reauthenticating",
            LinkState::Failed => "failed",
            LinkState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// State plus a human-readable reason, reported on the status channel for
/// the surrounding application to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    pub reason: String,
}

impl LinkStatus {
    pub(crate) fn new(state: LinkState, reason: impl Into<String>) -> Self {
        Self {
            state,
            reason: reason.into(),
        }
    }
}

impl Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.state, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names_match_reported_statuses() {
        assert_eq!(LinkState::SettingUp.to_string(), "setting-up");
        assert_eq!(LinkState::Active.to_string(), "active");
        assert_eq!(LinkState::Reauthenticating.to_string(), "reauthenticating");
        assert_eq!(LinkState::Failed.to_string(), "failed");
        assert_eq!(LinkState::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_status_display_includes_reason() {
        let status = LinkStatus::new(LinkState::Failed, "setup failed");
        assert_eq!(status.to_string(), "failed (setup failed)");
    }
}
