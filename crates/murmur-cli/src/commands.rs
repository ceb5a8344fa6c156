//! Slash commands typed while inside a room.

use room_store::ReactionKind;

/// One line of input in the room prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain text is sent as a chat message.
    Say(String),
    Mute,
    Unmute,
    Hand,
    Audio,
    Who,
    State,
    Messages,
    React(ReactionKind),
    Promote(String),
    Demote(String),
    MuteUser(String),
    Remove(String),
    Transfer(String),
    Unsay(String),
    DeleteRoom,
    Leave,
    Help,
    Empty,
}

pub const HELP: &str = "\
commands:
  <text>              send a chat message
  /mute, /unmute      mute or unmute yourself (speakers only)
  /hand               raise or lower your hand
  /audio              start playback after it was blocked
  /who                list who is in the room
  /state              show your membership
  /messages           show recent messages
  /react like|dislike toggle your reaction
  /unsay <id>         delete a message
host only:
  /promote <user>     bring a listener on stage
  /demote <user>      move a speaker to the audience
  /mute-user <user>   mute a speaker
  /remove <user>      remove someone from the room
  /transfer <user>    hand the room to someone else
  /delete-room        end the room for everyone
  /leave              leave the room";

/// Parse one input line.
pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Empty);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Say(line.to_string()));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let target = |build: fn(String) -> Command| {
        if arg.is_empty() {
            Err(format!("/{name} needs a user id"))
        } else {
            Ok(build(arg.to_string()))
        }
    };

    match name {
        "mute" => Ok(Command::Mute),
        "unmute" => Ok(Command::Unmute),
        "hand" => Ok(Command::Hand),
        "audio" => Ok(Command::Audio),
        "who" => Ok(Command::Who),
        "state" => Ok(Command::State),
        "messages" => Ok(Command::Messages),
        "react" => arg.parse().map(Command::React),
        "promote" => target(Command::Promote),
        "demote" => target(Command::Demote),
        "mute-user" => target(Command::MuteUser),
        "remove" => target(Command::Remove),
        "transfer" => target(Command::Transfer),
        "unsay" if arg.is_empty() => Err("/unsay needs a message id".to_string()),
        "unsay" => Ok(Command::Unsay(arg.to_string())),
        "delete-room" => Ok(Command::DeleteRoom),
        "leave" | "quit" => Ok(Command::Leave),
        "help" | "?" => Ok(Command::Help),
        other => Err(format!("unknown command /{other}, try /help")),
    }
}
