//! Client for the YouTube Lounge remote-control protocol.
//!
//! A `LoungeClient` pairs with a screen (TV app, console, browser), keeps a
//! bind channel open with `connect`/`subscribe` and sends playback commands.
//! Screen notifications arrive through an `EventListener`.

pub mod client;
pub mod config;
pub mod connection;
pub mod dial;
pub mod error;
pub mod events;
pub mod listener;
pub mod messages;
pub mod policy;
pub mod queue;
pub mod sequence;
pub mod session;
pub mod transport;

pub use client::LoungeClient;
pub use config::ClientConfig;
pub use connection::{ConnectionState, Termination};
pub use error::{LoungeError, Result};
pub use events::{Event, PlaybackStatus};
pub use listener::{Diagnostic, EventListener, NoopListener};
pub use messages::Command;
pub use session::{AuthState, LoungeToken, Screen, Session};
