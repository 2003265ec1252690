//! Contact lifecycle: the legal state transitions.
//!
//! ```text
//! Discovered → Requested → Connected → Messaged → { Replied, NoReply }
//!      └──────────┴────────────┴───────────┴──→ OptedOut
//! ```

use serde::{Deserialize, Serialize};

/// Persisted lifecycle state of a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactState {
    Discovered,
    Requested,
    Connected,
    Messaged,
    Replied,
    NoReply,
    OptedOut,
}

/// Something that happened to a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    RequestSent,
    AcceptanceDetected,
    MessageSent,
    ReplyDetected,
    ReplyWindowElapsed,
    OptOut,
}

impl ContactState {
    pub const ALL: [ContactState; 7] = [
        ContactState::Discovered,
        ContactState::Requested,
        ContactState::Connected,
        ContactState::Messaged,
        ContactState::Replied,
        ContactState::NoReply,
        ContactState::OptedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContactState::Discovered => "discovered",
            ContactState::Requested => "requested",
            ContactState::Connected => "connected",
            ContactState::Messaged => "messaged",
            ContactState::Replied => "replied",
            ContactState::NoReply => "no_reply",
            ContactState::OptedOut => "opted_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContactState::Replied | ContactState::NoReply | ContactState::OptedOut
        )
    }

    /// Position along the main path. Terminal side states share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            ContactState::Discovered => 0,
            ContactState::Requested => 1,
            ContactState::Connected => 2,
            ContactState::Messaged => 3,
            ContactState::Replied | ContactState::NoReply | ContactState::OptedOut => 4,
        }
    }

    /// Apply an event. `None` means the transition is not legal.
    pub fn next(self, event: LifecycleEvent) -> Option<ContactState> {
        use ContactState::*;
        use LifecycleEvent::*;
        match (self, event) {
            (state, OptOut) if !state.is_terminal() => Some(OptedOut),
            (Discovered, RequestSent) => Some(Requested),
            (Requested, AcceptanceDetected) => Some(Connected),
            (Connected, MessageSent) => Some(Messaged),
            (Messaged, ReplyDetected) => Some(Replied),
            (Messaged, ReplyWindowElapsed) => Some(NoReply),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContactState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::RequestSent => "request_sent",
            LifecycleEvent::AcceptanceDetected => "acceptance_detected",
            LifecycleEvent::MessageSent => "message_sent",
            LifecycleEvent::ReplyDetected => "reply_detected",
            LifecycleEvent::ReplyWindowElapsed => "reply_window_elapsed",
            LifecycleEvent::OptOut => "opt_out",
        }
    }

    /// The event that moves a contact one step closer to `target`, if any.
    pub fn toward(target: ContactState) -> Option<LifecycleEvent> {
        match target {
            ContactState::Requested => Some(LifecycleEvent::RequestSent),
            ContactState::Connected => Some(LifecycleEvent::AcceptanceDetected),
            ContactState::Messaged => Some(LifecycleEvent::MessageSent),
            ContactState::Replied => Some(LifecycleEvent::ReplyDetected),
            ContactState::NoReply => Some(LifecycleEvent::ReplyWindowElapsed),
            ContactState::OptedOut => Some(LifecycleEvent::OptOut),
            ContactState::Discovered => None,
        }
    }
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_path() {
        let s = ContactState::Discovered;
        let s = s.next(LifecycleEvent::RequestSent).unwrap();
        let s = s.next(LifecycleEvent::AcceptanceDetected).unwrap();
        let s = s.next(LifecycleEvent::MessageSent).unwrap();
        assert_eq!(s, ContactState::Messaged);
        assert_eq!(s.next(LifecycleEvent::ReplyDetected), Some(ContactState::Replied));
        assert_eq!(
            s.next(LifecycleEvent::ReplyWindowElapsed),
            Some(ContactState::NoReply)
        );
    }

    #[test]
    fn test_opt_out_from_any_non_terminal() {
        for state in ContactState::ALL {
            let next = state.next(LifecycleEvent::OptOut);
            if state.is_terminal() {
                assert!(next.is_none(), "{state} should reject opt-out");
            } else {
                assert_eq!(next, Some(ContactState::OptedOut));
            }
        }
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(ContactState::Discovered.next(LifecycleEvent::MessageSent).is_none());
        assert!(ContactState::Requested.next(LifecycleEvent::RequestSent).is_none());
        assert!(ContactState::Replied.next(LifecycleEvent::ReplyWindowElapsed).is_none());
    }

    #[test]
    fn test_parse_roundtrip_names() {
        assert_eq!(ContactState::parse("no_reply"), Some(ContactState::NoReply));
        assert_eq!(ContactState::parse("bogus"), None);
    }
}
