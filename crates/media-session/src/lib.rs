//! Media-session and token-issuer seams.
//!
//! The reconciler drives audio through [`MediaSession`] and fetches grants
//! through [`TokenIssuer`]. [`FunctionTokenIssuer`] calls the backend's
//! token function; [`HeadlessMediaSession`] stands in where no audio
//! device exists.

mod error;
mod headless;
mod session;
mod token;

pub use error::{MediaError, MediaResult};
pub use headless::{HeadlessConnection, HeadlessMediaSession};
pub use session::{AudioPlayback, MediaSession};
pub use token::{FunctionTokenIssuer, MediaGrant, MediaTokenRequest, TokenIssuer};
