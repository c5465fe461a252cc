//! Stream session state management

/// Stream session state machine
///
/// ```text
/// Created → OfferReady → AwaitingAnswer → Connected → Streaming
/// ```
/// Any live state can fail on a transport failure or be closed. Closed and
/// Failed are terminal except that a failed session may still be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport endpoint being built
    Created,

    /// Local offer generated, candidate gathering complete
    OfferReady,

    /// Remote answer applied, waiting for the transport to connect
    AwaitingAnswer,

    /// Transport connected, no track yet
    Connected,

    /// At least one inbound track is being read
    Streaming,

    /// Teardown in progress
    Closing,

    /// Teardown finished
    Closed,

    /// Transport-level failure; the session does not retry
    Failed,
}

impl SessionState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &SessionState) -> bool {
        use SessionState::*;

        match (self, target) {
            (Created, OfferReady) => true,
            (OfferReady, AwaitingAnswer) => true,
            (AwaitingAnswer, Connected) => true,
            (Connected, Streaming) => true,

            // Teardown
            (Closing, Closed) => true,
            (Closed, _) => false,
            (Failed, Closing) => true,
            (Failed, _) => false,
            (_, Closing) => true,

            // Transport failure from any live state
            (Closing, Failed) => false,
            (_, Failed) => true,

            (a, b) if a == b => true,

            _ => false,
        }
    }

    /// Check if the session still owns a live transport
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            SessionState::Closing | SessionState::Closed | SessionState::Failed
        )
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            SessionState::Created => "Created",
            SessionState::OfferReady => "OfferReady",
            SessionState::AwaitingAnswer => "AwaitingAnswer",
            SessionState::Connected => "Connected",
            SessionState::Streaming => "Streaming",
            SessionState::Closing => "Closing",
            SessionState::Closed => "Closed",
            SessionState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [Created, OfferReady, AwaitingAnswer, Connected, Streaming];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{:?}", pair);
        }
        assert!(Streaming.can_transition_to(&Closing));
        assert!(Closing.can_transition_to(&Closed));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!Created.can_transition_to(&Streaming));
        assert!(!Streaming.can_transition_to(&Connected));
        assert!(!Closed.can_transition_to(&Created));
        assert!(!Closed.can_transition_to(&Failed));
        assert!(!Failed.can_transition_to(&Streaming));
        assert!(!Closing.can_transition_to(&Failed));
    }

    #[test]
    fn test_failure_and_close_from_live_states() {
        for state in [Created, OfferReady, AwaitingAnswer, Connected, Streaming] {
            assert!(state.can_transition_to(&Failed));
            assert!(state.can_transition_to(&Closing));
            assert!(state.is_active());
        }
        assert!(Failed.can_transition_to(&Closing));
        assert!(!Closed.is_active());
    }
}
