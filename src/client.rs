//! `LoungeClient`: one remote bound to one screen.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionState, Termination};
use crate::error::Result;
use crate::listener::{EventDispatcher, EventListener};
use crate::messages::{fmt_time, Command};
use crate::queue::CommandQueue;
use crate::session::{AuthState, Session, SessionManager};
use crate::transport::{ReqwestTransport, Transport};

pub struct LoungeClient {
    session: Arc<SessionManager>,
    dispatcher: Arc<EventDispatcher>,
    connection: Arc<Connection>,
    queue: CommandQueue,
}

impl LoungeClient {
    /// Client backed by `reqwest`.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(Duration::from_secs(config.request_timeout_secs))?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let config = Arc::new(config);
        let session = Arc::new(SessionManager::new(transport.clone(), config.clone()));
        let dispatcher = Arc::new(EventDispatcher::new(session.clone()));
        let connection = Arc::new(Connection::new(
            transport,
            config,
            session.clone(),
            dispatcher.clone(),
        ));
        let queue = CommandQueue::new(connection.clone());
        Self {
            session,
            dispatcher,
            connection,
            queue,
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn EventListener>) {
        self.dispatcher.set_listener(listener);
    }

    // -- session -------------------------------------------------------------

    pub async fn pair(&self, pairing_code: &str) -> Result<Session> {
        let session = self.session.pair(pairing_code).await?;
        self.connection.mark_linked();
        Ok(session)
    }

    /// Link to a screen found some other way (DIAL, saved id).
    pub async fn link(&self, screen_id: &str, screen_name: Option<&str>) -> Result<Session> {
        let session = self.session.link(screen_id, screen_name).await?;
        self.connection.mark_linked();
        Ok(session)
    }

    pub async fn refresh_auth(&self) -> Result<bool> {
        let refreshed = self.session.refresh_auth().await?;
        if refreshed {
            self.connection.mark_linked();
        }
        Ok(refreshed)
    }

    pub async fn is_available(&self) -> Result<bool> {
        self.session.is_available().await
    }

    pub fn is_paired(&self) -> bool {
        self.session.is_paired()
    }

    pub fn is_linked(&self) -> bool {
        self.session.is_linked()
    }

    pub fn auth_state(&self) -> AuthState {
        self.session.auth_state()
    }

    /// Restore persisted credentials. Returns false for an unknown layout.
    pub fn load_auth_state(&self, state: AuthState) -> bool {
        if !self.session.load_auth_state(state) {
            return false;
        }
        if self.session.is_linked() {
            self.connection.mark_linked();
        }
        true
    }

    pub fn screen_name(&self) -> Option<String> {
        self.session.screen_name()
    }

    pub fn screen_device_name(&self) -> Option<String> {
        self.session.screen_device_name()
    }

    // -- connection ------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Drive the poll loop until the channel terminates.
    pub async fn subscribe(&self) -> Result<Termination> {
        self.connection.subscribe().await
    }

    pub async fn disconnect(&self) -> Result<bool> {
        self.connection.disconnect().await
    }

    pub fn close(&self) {
        self.connection.close();
    }

    // -- commands --------------------------------------------------------------

    pub async fn submit(&self, command: Command) -> Result<bool> {
        self.queue.submit(command).await
    }

    pub async fn play(&self) -> Result<bool> {
        self.submit(Command::new("play")).await
    }

    pub async fn pause(&self) -> Result<bool> {
        self.submit(Command::new("pause")).await
    }

    pub async fn previous(&self) -> Result<bool> {
        self.submit(Command::new("previous")).await
    }

    pub async fn next(&self) -> Result<bool> {
        self.submit(Command::new("next")).await
    }

    pub async fn seek_to(&self, seconds: f64) -> Result<bool> {
        self.submit(Command::new("seekTo").with_param("newTime", fmt_time(seconds)))
            .await
    }

    pub async fn skip_ad(&self) -> Result<bool> {
        self.submit(Command::new("skipAd")).await
    }

    /// Volume is clamped to `0..=100`.
    pub async fn set_volume(&self, volume: u32) -> Result<bool> {
        self.submit(Command::new("setVolume").with_param("volume", volume.min(100).to_string()))
            .await
    }

    pub async fn set_autoplay_mode(&self, enabled: bool) -> Result<bool> {
        let mode = if enabled { "ENABLED" } else { "DISABLED" };
        self.submit(Command::new("setAutoplayMode").with_param("autoplayMode", mode))
            .await
    }

    pub async fn set_playback_speed(&self, speed: f64) -> Result<bool> {
        self.submit(Command::new("setPlaybackSpeed").with_param("playbackSpeed", speed.to_string()))
            .await
    }

    /// Replace the screen's queue with a single video.
    pub async fn play_video(&self, video_id: &str) -> Result<bool> {
        self.submit(
            Command::new("setPlaylist")
                .with_param("videoId", video_id)
                .with_param("currentIndex", "0")
                .with_param("currentTime", "0"),
        )
        .await
    }
}
