//! Configuration, paths, session context and logging setup for Murmur.

mod config;
mod error;
mod logging;
mod paths;
mod session;

pub use config::{
    Config, DEFAULT_LOG_LEVEL, DEFAULT_MEDIA_TOKEN_FUNCTION, DEFAULT_REALTIME_HEARTBEAT_SECS,
    DEFAULT_SUPABASE_PUBLISHABLE_KEY, DEFAULT_SUPABASE_URL,
};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level};
pub use paths::Paths;
pub use session::{AuthContext, SessionHandle};
