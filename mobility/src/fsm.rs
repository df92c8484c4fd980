//! §9 Design Notes: "Mobility FSM is an explicit enum + transition table
//! with per-state allowed events and timers". This replaces the dict-of-
//! flags style explicitly called out as needing re-architecture.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    NotRegistered,
    RegistrationInProgress,
    Registered,
    HandoverInProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserEvent {
    /// A candidate link appeared (startup scan or a later PUT); carries no
    /// state of its own, the caller evaluates eligibility before calling
    /// [`UserState::on_event`].
    LinkEligible,
    SentRegistrationRequest,
    RegistrationAccepted,
    RegistrationTimedOut,
    SentHandoverRequest,
    HandoverCommandReceived,
    HandoverTimedOut,
    /// The link record for the currently-serving peer was deleted.
    CurrentLinkDeleted,
}

impl UserState {
    /// Returns the next state for `event`, or `None` if `event` is not a
    /// legal transition out of `self` (the caller should ignore it).
    pub fn on_event(self, event: UserEvent) -> Option<UserState> {
        use UserEvent::*;
        use UserState::*;

        match (self, event) {
            (NotRegistered, LinkEligible) => Some(NotRegistered),
            (NotRegistered, SentRegistrationRequest) => Some(RegistrationInProgress),

            (RegistrationInProgress, RegistrationAccepted) => Some(Registered),
            (RegistrationInProgress, RegistrationTimedOut) => Some(NotRegistered),

            (Registered, LinkEligible) => Some(Registered),
            (Registered, SentHandoverRequest) => Some(HandoverInProgress),
            (Registered, CurrentLinkDeleted) => Some(NotRegistered),

            (HandoverInProgress, HandoverCommandReceived) => Some(Registered),
            (HandoverInProgress, HandoverTimedOut) => Some(Registered),
            (HandoverInProgress, CurrentLinkDeleted) => Some(NotRegistered),

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_round_trip() {
        let s = UserState::NotRegistered;
        let s = s.on_event(UserEvent::SentRegistrationRequest).unwrap();
        assert_eq!(s, UserState::RegistrationInProgress);
        let s = s.on_event(UserEvent::RegistrationAccepted).unwrap();
        assert_eq!(s, UserState::Registered);
    }

    #[test]
    fn registration_timeout_resets_to_not_registered() {
        let s = UserState::RegistrationInProgress;
        assert_eq!(s.on_event(UserEvent::RegistrationTimedOut), Some(UserState::NotRegistered));
    }

    #[test]
    fn handover_timeout_falls_back_to_registered_not_not_registered() {
        let s = UserState::HandoverInProgress;
        assert_eq!(s.on_event(UserEvent::HandoverTimedOut), Some(UserState::Registered));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        assert_eq!(UserState::NotRegistered.on_event(UserEvent::HandoverCommandReceived), None);
    }

    #[test]
    fn deleting_the_current_link_always_resets_to_not_registered() {
        assert_eq!(UserState::Registered.on_event(UserEvent::CurrentLinkDeleted), Some(UserState::NotRegistered));
        assert_eq!(UserState::HandoverInProgress.on_event(UserEvent::CurrentLinkDeleted), Some(UserState::NotRegistered));
    }
}
