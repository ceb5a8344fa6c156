//! Room membership state machine using rust-fsm.
//!
//! ## State Diagram
//!
//! ```text
//!                    ┌─────────────────┐
//!                    │    NotJoined    │ (initial)
//!                    └───┬─────────┬───┘
//!      JoinedAsListener  │         │  JoinedAsSpeaker
//!                        ▼         ▼
//! ┌─────────────────┐  Promoted  ┌─────────────────┐
//! │ JoinedListener  │ ─────────► │  Reconnecting   │
//! │                 │ ◄───────── │                 │
//! └─────────────────┘ Reconnected└─────────────────┘
//!                       AsListener   ▲       │ ReconnectedAsSpeaker
//!                                    │Demoted▼
//!                            ┌─────────────────┐
//!                            │  JoinedSpeaker  │
//!                            └─────────────────┘
//!
//! Every joined state (Reconnecting included) returns to NotJoined on
//! Left, Removed or RoomDeleted.
//! ```
//!
//! "Speaker" here means "publishes audio": the room host sits in
//! `JoinedSpeaker` too.

use rust_fsm::*;
use serde::{Deserialize, Serialize};

state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub membership_machine(NotJoined)

    NotJoined => {
        JoinedAsListener => JoinedListener,
        JoinedAsSpeaker => JoinedSpeaker
    },
    JoinedListener => {
        Promoted => Reconnecting,
        Left => NotJoined,
        Removed => NotJoined,
        RoomDeleted => NotJoined
    },
    JoinedSpeaker => {
        Demoted => Reconnecting,
        Left => NotJoined,
        Removed => NotJoined,
        RoomDeleted => NotJoined
    },
    Reconnecting => {
        // Another flip while the previous reconnect is still running
        Promoted => Reconnecting,
        Demoted => Reconnecting,
        ReconnectedAsSpeaker => JoinedSpeaker,
        ReconnectedAsListener => JoinedListener,
        Left => NotJoined,
        Removed => NotJoined,
        RoomDeleted => NotJoined
    }
}

pub use membership_machine::Input as MembershipInput;
pub use membership_machine::State as MembershipState;
pub use membership_machine::StateMachine as MembershipMachine;

/// Pure transition: the next state, or `None` when `input` is not valid in `state`.
pub fn transition(state: &MembershipState, input: &MembershipInput) -> Option<MembershipState> {
    <membership_machine::Impl as StateMachineImpl>::transition(state, input)
}

/// Membership as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    NotJoined,
    JoinedListener,
    JoinedSpeaker,
    Reconnecting,
}

impl Membership {
    pub fn is_joined(&self) -> bool {
        !matches!(self, Membership::NotJoined)
    }
}

impl From<&MembershipState> for Membership {
    fn from(state: &MembershipState) -> Self {
        match state {
            MembershipState::NotJoined => Membership::NotJoined,
            MembershipState::JoinedListener => Membership::JoinedListener,
            MembershipState::JoinedSpeaker => Membership::JoinedSpeaker,
            MembershipState::Reconnecting => Membership::Reconnecting,
        }
    }
}

/// Input that lands a fresh join in the right state.
pub fn join_input(publishing: bool) -> MembershipInput {
    if publishing {
        MembershipInput::JoinedAsSpeaker
    } else {
        MembershipInput::JoinedAsListener
    }
}

/// Input that completes a reconnect.
pub fn reconnected_input(publishing: bool) -> MembershipInput {
    if publishing {
        MembershipInput::ReconnectedAsSpeaker
    } else {
        MembershipInput::ReconnectedAsListener
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_not_joined() {
        let machine = MembershipMachine::new();
        assert_eq!(*machine.state(), MembershipState::NotJoined);
    }

    #[test]
    fn test_listener_promotion_flow() {
        let mut machine = MembershipMachine::new();

        machine.consume(&MembershipInput::JoinedAsListener).unwrap();
        assert_eq!(*machine.state(), MembershipState::JoinedListener);

        machine.consume(&MembershipInput::Promoted).unwrap();
        assert_eq!(*machine.state(), MembershipState::Reconnecting);

        machine
            .consume(&MembershipInput::ReconnectedAsSpeaker)
            .unwrap();
        assert_eq!(*machine.state(), MembershipState::JoinedSpeaker);
    }

    #[test]
    fn test_speaker_demotion_flow() {
        let mut machine = MembershipMachine::new();

        machine.consume(&MembershipInput::JoinedAsSpeaker).unwrap();
        machine.consume(&MembershipInput::Demoted).unwrap();
        assert_eq!(*machine.state(), MembershipState::Reconnecting);

        machine
            .consume(&MembershipInput::ReconnectedAsListener)
            .unwrap();
        assert_eq!(*machine.state(), MembershipState::JoinedListener);
    }

    #[test]
    fn test_cannot_skip_reconnecting() {
        let mut machine = MembershipMachine::new();
        machine.consume(&MembershipInput::JoinedAsListener).unwrap();

        // A listener cannot land in JoinedSpeaker without reconnecting
        let result = machine.consume(&MembershipInput::ReconnectedAsSpeaker);
        assert!(result.is_err());
        assert_eq!(*machine.state(), MembershipState::JoinedListener);
    }

    #[test]
    fn test_listener_cannot_be_demoted() {
        assert_eq!(
            transition(&MembershipState::JoinedListener, &MembershipInput::Demoted),
            None
        );
        assert_eq!(
            transition(&MembershipState::JoinedSpeaker, &MembershipInput::Promoted),
            None
        );
    }

    #[test]
    fn test_every_joined_state_can_exit() {
        for state in [
            MembershipState::JoinedListener,
            MembershipState::JoinedSpeaker,
            MembershipState::Reconnecting,
        ] {
            for input in [
                MembershipInput::Left,
                MembershipInput::Removed,
                MembershipInput::RoomDeleted,
            ] {
                assert_eq!(
                    transition(&state, &input),
                    Some(MembershipState::NotJoined),
                    "{state:?} + {input:?}"
                );
            }
        }
    }

    #[test]
    fn test_not_joined_ignores_exits() {
        assert_eq!(
            transition(&MembershipState::NotJoined, &MembershipInput::Left),
            None
        );
        assert_eq!(
            transition(&MembershipState::NotJoined, &MembershipInput::Promoted),
            None
        );
    }

    #[test]
    fn test_flip_during_reconnect_stays_reconnecting() {
        assert_eq!(
            transition(&MembershipState::Reconnecting, &MembershipInput::Demoted),
            Some(MembershipState::Reconnecting)
        );
    }

    #[test]
    fn test_join_and_reconnect_inputs() {
        assert_eq!(join_input(true), MembershipInput::JoinedAsSpeaker);
        assert_eq!(join_input(false), MembershipInput::JoinedAsListener);
        assert_eq!(reconnected_input(true), MembershipInput::ReconnectedAsSpeaker);
        assert_eq!(reconnected_input(false), MembershipInput::ReconnectedAsListener);
    }

    #[test]
    fn test_membership_from_state() {
        assert_eq!(
            Membership::from(&MembershipState::Reconnecting),
            Membership::Reconnecting
        );
        assert!(Membership::JoinedListener.is_joined());
        assert!(!Membership::NotJoined.is_joined());
    }
}
