//! Wiring of the backend clients and the interactive room loop.

use crate::commands::{self, Command, HELP};
use crate::render;
use media_session::{FunctionTokenIssuer, HeadlessMediaSession};
use room_config_and_utils::{Config, SessionHandle};
use room_realtime::{RealtimeClient, RealtimeConfig};
use room_reconciler::{Collaborators, ReconcilerResult, RoomReconciler};
use room_store::{ReactionKind, SupabaseRoomStore};
use std::error::Error;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

type CliResult<T> = Result<T, Box<dyn Error>>;

const MESSAGES_SHOWN: usize = 20;

pub struct App {
    reconciler: RoomReconciler,
    realtime: Arc<RealtimeClient>,
}

impl App {
    /// Build the collaborators and start the realtime socket.
    pub fn connect(config: &Config, session: SessionHandle) -> CliResult<Self> {
        let identity = session.user_id().unwrap_or_else(|| "anonymous".to_string());
        let store = SupabaseRoomStore::from_config(config, session.clone())?;
        let tokens = FunctionTokenIssuer::from_config(config, session.clone())?;
        let realtime = Arc::new(RealtimeClient::new(
            RealtimeConfig::from_config(config)?,
            session.clone(),
        ));
        realtime.connect();

        let reconciler = RoomReconciler::new(Collaborators {
            store: Arc::new(store),
            feed: realtime.clone(),
            media: Arc::new(HeadlessMediaSession::new(identity)),
            tokens: Arc::new(tokens),
            session,
        });
        Ok(Self {
            reconciler,
            realtime,
        })
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.reconciler.close().await {
            warn!(error = %e, "Leaving room on shutdown failed");
        }
        self.realtime.shutdown().await;
    }

    pub async fn list_rooms(&self) -> CliResult<()> {
        let rooms = self.reconciler.list_rooms().await?;
        if rooms.is_empty() {
            println!("no active rooms");
        }
        for room in &rooms {
            println!("{}", render::room_line(room));
        }
        Ok(())
    }

    pub async fn create_room(
        &self,
        title: &str,
        description: Option<&str>,
        topic: Option<&str>,
        capacity: i32,
        join: bool,
    ) -> CliResult<()> {
        let room = self
            .reconciler
            .create_room(title, description, topic, capacity)
            .await?;
        println!("created {}", render::room_line(&room));
        if join {
            self.run_room(&room.id).await?;
        }
        Ok(())
    }

    pub async fn react(&self, room_id: &str, reaction: &str) -> CliResult<()> {
        let kind: ReactionKind = reaction.parse()?;
        match self.reconciler.toggle_reaction(room_id, kind).await? {
            Some(kind) => println!("you now {kind} this room"),
            None => println!("reaction cleared"),
        }
        Ok(())
    }

    /// Join `room_id` and read slash commands until the user leaves or the
    /// room goes away.
    pub async fn run_room(&self, room_id: &str) -> CliResult<()> {
        let mut notices = self.reconciler.notices();
        let local = self.reconciler.join(room_id).await?;
        println!("{}", render::state(&local));
        println!("type /help for commands");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        info!("Input closed");
                        break;
                    };
                    match commands::parse(&line) {
                        Ok(Command::Leave) => break,
                        Ok(command) => {
                            if let Err(e) = self.execute(command).await {
                                if e.is_transient() {
                                    eprintln!("error: {e} (try again)");
                                } else {
                                    eprintln!("error: {e}");
                                }
                            }
                        }
                        Err(message) => eprintln!("{message}"),
                    }
                }

                notice = notices.recv() => match notice {
                    Ok(notice) => println!("! {notice}"),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Notices lagged"),
                    Err(RecvError::Closed) => break,
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
            }

            if self.reconciler.snapshot().is_none() {
                println!("you are no longer in the room");
                break;
            }
        }

        self.reconciler.leave().await?;
        Ok(())
    }

    async fn execute(&self, command: Command) -> ReconcilerResult<()> {
        let reconciler = &self.reconciler;
        match command {
            Command::Empty | Command::Leave => {}
            Command::Help => println!("{HELP}"),
            Command::Say(text) => {
                reconciler.send_message(&text).await?;
            }
            Command::Mute => reconciler.set_self_mute(true).await?,
            Command::Unmute => reconciler.set_self_mute(false).await?,
            Command::Hand => {
                let raised = reconciler.toggle_hand_raise().await?;
                println!("hand {}", if raised { "raised" } else { "lowered" });
            }
            Command::Audio => {
                let playback = reconciler.start_audio().await?;
                println!("playback {playback:?}");
            }
            Command::Who => {
                if let Some(view) = reconciler.room_view() {
                    println!("{}", render::who(&view, reconciler.snapshot().as_ref()));
                }
            }
            Command::State => {
                if let Some(local) = reconciler.snapshot() {
                    println!("{}", render::state(&local));
                }
            }
            Command::Messages => {
                if let Some(view) = reconciler.room_view() {
                    println!("{}", render::messages(&view, MESSAGES_SHOWN));
                }
            }
            Command::React(kind) => {
                let Some(local) = reconciler.snapshot() else {
                    return Ok(());
                };
                match reconciler.toggle_reaction(&local.room_id, kind).await? {
                    Some(kind) => println!("you now {kind} this room"),
                    None => println!("reaction cleared"),
                }
            }
            Command::Promote(user_id) => {
                reconciler.promote(&user_id).await?;
                println!("{user_id} is now a speaker");
            }
            Command::Demote(user_id) => {
                reconciler.demote(&user_id).await?;
                println!("{user_id} is now a listener");
            }
            Command::MuteUser(user_id) => {
                reconciler.mute_participant(&user_id).await?;
                println!("{user_id} muted");
            }
            Command::Remove(user_id) => {
                if reconciler.remove_participant(&user_id).await? {
                    println!("{user_id} removed");
                } else {
                    println!("{user_id} was not in the room");
                }
            }
            Command::Transfer(user_id) => {
                reconciler.transfer_ownership(&user_id).await?;
                println!("{user_id} now hosts the room");
            }
            Command::Unsay(message_id) => {
                reconciler.delete_message(&message_id).await?;
            }
            Command::DeleteRoom => {
                reconciler.delete_room().await?;
                println!("room deleted");
            }
        }
        Ok(())
    }
}
