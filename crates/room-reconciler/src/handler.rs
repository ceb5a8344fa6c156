use crate::changes::RoomChange;
use crate::fsm::{reconnected_input, transition, MembershipInput, MembershipState};
use crate::notice::Notice;
use crate::ports::{Effect, HandlerDeps, LogLevel, Transition};
use crate::state::LocalRoomState;
use room_store::{Participant, ParticipantRole, ReactionKind, Room};

/// React to one room change. Pure: the caller owns the state and runs
/// the returned effects.
///
/// `stale` marks a participant update for the local user that contradicts
/// a pending optimistic write; its mute and hand fields are not adopted.
pub fn handle_change(
    local: Option<&LocalRoomState>,
    change: &RoomChange,
    stale: bool,
    deps: &HandlerDeps,
) -> Transition {
    let Some(current) = local else {
        return Transition::unchanged(None);
    };
    if change.room_id() != current.room_id {
        return Transition::unchanged(local);
    }

    match change {
        RoomChange::ParticipantUpserted(row) if row.user_id == deps.local_user_id => {
            on_local_participant_updated(current, row, stale)
        }
        RoomChange::ParticipantDeleted { user_id, .. } if *user_id == deps.local_user_id => {
            exit_room(current, MembershipInput::Removed, Notice::Removed {
                room_id: current.room_id.clone(),
            })
        }
        RoomChange::RoomDeleted { .. } => exit_room(
            current,
            MembershipInput::RoomDeleted,
            Notice::RoomClosed {
                room_id: current.room_id.clone(),
            },
        ),
        RoomChange::RoomUpdated(room) if !room.is_active => exit_room(
            current,
            MembershipInput::RoomDeleted,
            Notice::RoomClosed {
                room_id: current.room_id.clone(),
            },
        ),
        // Other users' rows and room/reaction/message updates only refresh the view.
        _ => Transition::unchanged(local),
    }
}

fn on_local_participant_updated(
    current: &LocalRoomState,
    row: &Participant,
    stale: bool,
) -> Transition {
    let mut next = current.clone();
    let mut effects = Vec::new();

    let was_publishing = current.role.can_publish();
    let publishing = row.role.can_publish();

    if row.role != current.role {
        next.role = row.role;

        if publishing != was_publishing {
            let input = if publishing {
                MembershipInput::Promoted
            } else {
                MembershipInput::Demoted
            };
            match transition(&current.membership, &input) {
                Some(state) => next.membership = state,
                None => effects.push(Effect::Log {
                    level: LogLevel::Warn,
                    message: format!(
                        "role change {} -> {} not valid from {:?}",
                        current.role, row.role, current.membership
                    ),
                }),
            }
            if !publishing {
                next.is_muted = true;
            }
            effects.push(Effect::Log {
                level: LogLevel::Info,
                message: format!(
                    "role changed {} -> {}, reconnecting media",
                    current.role, row.role
                ),
            });
            effects.push(Effect::ReconnectMedia {
                as_speaker: publishing,
            });
        } else {
            effects.push(Effect::Log {
                level: LogLevel::Info,
                message: format!("role changed {} -> {}", current.role, row.role),
            });
        }
    }

    if stale {
        effects.push(Effect::Log {
            level: LogLevel::Debug,
            message: "ignoring stale mute/hand fields for local participant".to_string(),
        });
    } else {
        // A demotion forces mute regardless of what the row says.
        if publishing {
            next.is_muted = row.is_muted;
        } else {
            next.is_muted = true;
        }
        next.is_hand_raised = row.is_hand_raised;

        let reconnecting = effects
            .iter()
            .any(|effect| matches!(effect, Effect::ReconnectMedia { .. }));
        if publishing && !reconnecting && next.is_muted != current.is_muted {
            effects.push(Effect::SetMediaMute(next.is_muted));
        }
    }

    Transition {
        next: Some(next),
        effects,
    }
}

fn exit_room(current: &LocalRoomState, input: MembershipInput, notice: Notice) -> Transition {
    let mut effects = Vec::new();
    if transition(&current.membership, &input).is_none() {
        effects.push(Effect::Log {
            level: LogLevel::Warn,
            message: format!("{input:?} not valid from {:?}", current.membership),
        });
    }
    effects.push(Effect::Log {
        level: LogLevel::Info,
        message: format!("leaving room {} ({input:?})", current.room_id),
    });
    effects.push(Effect::DisconnectMedia);
    effects.push(Effect::ReleaseRoom);
    effects.push(Effect::Notice(notice));
    Transition {
        next: None,
        effects,
    }
}

/// Membership state once a reconnect has finished.
pub fn after_reconnect(current: &MembershipState, publishing: bool) -> Option<MembershipState> {
    transition(current, &reconnected_input(publishing))
}

/// Role for a fresh join: host for the room's host, listener for anyone else.
/// An existing row always wins.
pub fn plan_join_role(
    room: &Room,
    existing: Option<&Participant>,
    user_id: &str,
) -> ParticipantRole {
    match existing {
        Some(row) => row.role,
        None if room.is_hosted_by(user_id) => ParticipantRole::Host,
        None => ParticipantRole::Listener,
    }
}

/// Who takes over when the host leaves: the earliest-joined speaker, else
/// the earliest-joined listener.
pub fn pick_successor<'a>(
    participants: &'a [Participant],
    leaving: &str,
) -> Option<&'a Participant> {
    let mut candidates: Vec<&Participant> = participants
        .iter()
        .filter(|p| p.user_id != leaving)
        .collect();
    candidates.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
    candidates
        .iter()
        .find(|p| p.role == ParticipantRole::Speaker)
        .or_else(|| candidates.iter().find(|p| p.role == ParticipantRole::Listener))
        .copied()
}

/// Store write needed to toggle a reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionPlan {
    Insert(ReactionKind),
    Update(ReactionKind),
    Delete,
}

impl ReactionPlan {
    /// Reaction held once the plan is applied.
    pub fn outcome(self) -> Option<ReactionKind> {
        match self {
            ReactionPlan::Insert(kind) | ReactionPlan::Update(kind) => Some(kind),
            ReactionPlan::Delete => None,
        }
    }
}

/// Selecting the active reaction removes it; selecting the other one
/// overwrites in place; selecting with none inserts.
pub fn plan_reaction_toggle(current: Option<ReactionKind>, selected: ReactionKind) -> ReactionPlan {
    match current {
        None => ReactionPlan::Insert(selected),
        Some(kind) if kind == selected => ReactionPlan::Delete,
        Some(_) => ReactionPlan::Update(selected),
    }
}
