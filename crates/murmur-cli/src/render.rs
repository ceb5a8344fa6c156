//! Plain-text rendering of rooms and room state.

use room_reconciler::{AudioStatus, LocalRoomState, RoomView};
use room_store::{Participant, Room};
use std::fmt::Write;

pub fn room_line(room: &Room) -> String {
    let mut line = format!("{}  {}", room.id, room.title);
    if let Some(topic) = &room.topic {
        let _ = write!(line, "  [{topic}]");
    }
    let _ = write!(
        line,
        "  host={} capacity={} likes={} dislikes={}",
        room.host_id, room.capacity, room.like_count, room.dislike_count
    );
    line
}

fn participant_line(participant: &Participant, speaking: bool) -> String {
    let mut flags = Vec::new();
    if speaking {
        flags.push("speaking");
    }
    if participant.is_muted {
        flags.push("muted");
    }
    if participant.is_hand_raised {
        flags.push("hand raised");
    }
    if flags.is_empty() {
        format!("  {} ({})", participant.user_id, participant.role)
    } else {
        format!(
            "  {} ({}) {}",
            participant.user_id,
            participant.role,
            flags.join(", ")
        )
    }
}

/// Stage and audience of a room.
pub fn who(view: &RoomView, local: Option<&LocalRoomState>) -> String {
    let speaking = |user_id: &str| local.map_or(false, |l| l.speaking.contains(user_id));
    let mut out = String::new();
    if let Some(room) = &view.room {
        let _ = writeln!(out, "{}", room_line(room));
    }
    let _ = writeln!(out, "stage:");
    for participant in view.speakers() {
        let _ = writeln!(out, "{}", participant_line(participant, speaking(&participant.user_id)));
    }
    let _ = writeln!(out, "audience:");
    for participant in view.listeners() {
        let _ = writeln!(out, "{}", participant_line(participant, false));
    }
    let counts = view.counts();
    let _ = write!(out, "reactions: {} likes, {} dislikes", counts.likes, counts.dislikes);
    out
}

pub fn state(local: &LocalRoomState) -> String {
    let audio = match local.audio {
        AudioStatus::Idle => "idle",
        AudioStatus::Connected { publishing: true } => "connected, publishing",
        AudioStatus::Connected { publishing: false } => "connected, listening",
        AudioStatus::Degraded => "unavailable",
    };
    let mut out = format!(
        "room {} as {} ({:?}), audio {audio}",
        local.room_id,
        local.role,
        local.membership()
    );
    if local.is_muted {
        out.push_str(", muted");
    }
    if local.is_hand_raised {
        out.push_str(", hand raised");
    }
    if local.needs_audio_start {
        out.push_str(", playback blocked (/audio)");
    }
    out
}

pub fn messages(view: &RoomView, limit: usize) -> String {
    let visible: Vec<_> = view.visible_messages().collect();
    let skip = visible.len().saturating_sub(limit);
    visible[skip..]
        .iter()
        .map(|m| {
            format!(
                "[{}] {}: {}  ({})",
                m.created_at.format("%H:%M"),
                m.user_id,
                m.content,
                m.id
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
