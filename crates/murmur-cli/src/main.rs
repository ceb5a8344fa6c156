//! Murmur - terminal client for live audio rooms.

mod app;
mod commands;
mod render;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use room_config_and_utils::{init_logging, AuthContext, Config, Paths, SessionHandle};

/// Murmur command-line interface.
#[derive(Parser)]
#[command(name = "murmur")]
#[command(about = "Join and run live audio rooms from the terminal")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Defaults to the config file's level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for runtime files (config, logs). Defaults to ~/.murmur
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Signed-in user id
    #[arg(long, env = "MURMUR_USER_ID", global = true)]
    user_id: Option<String>,

    /// Access token for the signed-in user
    #[arg(long, env = "MURMUR_ACCESS_TOKEN", global = true, hide_env_values = true)]
    access_token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List active rooms
    Rooms,
    /// Create a room hosted by you
    Create {
        /// Room title
        title: String,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(short, long)]
        topic: Option<String>,
        /// Maximum number of participants
        #[arg(short, long, default_value_t = 50)]
        capacity: i32,
        /// Join the room right away
        #[arg(short, long)]
        join: bool,
    },
    /// Join a room and stay in it until /leave or Ctrl-C
    Join {
        /// Room id
        room_id: String,
    },
    /// Toggle a like or dislike on a room
    React {
        /// Room id
        room_id: String,
        /// like or dislike
        reaction: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let config = Config::load(&paths)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    init_logging("murmur", level);

    let session = match (cli.user_id, cli.access_token) {
        (Some(user_id), Some(token)) => SessionHandle::signed_in(AuthContext::new(user_id, token)),
        _ => SessionHandle::new(),
    };

    let app = app::App::connect(&config, session)?;
    let result = match cli.command {
        Commands::Rooms => app.list_rooms().await,
        Commands::Create {
            title,
            description,
            topic,
            capacity,
            join,
        } => {
            app.create_room(&title, description.as_deref(), topic.as_deref(), capacity, join)
                .await
        }
        Commands::Join { room_id } => app.run_room(&room_id).await,
        Commands::React { room_id, reaction } => app.react(&room_id, &reaction).await,
    };
    app.shutdown().await;

    result
}
