//! Listener capability set and the dispatcher that drives it.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::events::{
    AdPlayingChanged, AdStateChanged, AutoplayModeChanged, AutoplayUpNextChanged, Event,
    NowPlaying, PlaybackSpeedChanged, PlaybackState, ScreenDisconnected, SubtitlesTrackChanged,
    VolumeChanged,
};
use crate::session::SessionManager;

/// Optional notices about the channel's health. Transient faults are only
/// visible through these until the retry budget runs out.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    Retrying { attempt: u32, delay: Duration },
    Reconnected { generation: u64 },
    TokenRefreshed,
    UnknownEvent { name: String },
}

/// Receives screen notifications. Every method defaults to a no-op, so
/// implementors only override what they care about.
///
/// Methods are awaited one at a time in delivery order; a slow listener
/// delays the next event rather than racing it.
#[async_trait]
pub trait EventListener: Send + Sync {
    /// Active video changed.
    async fn now_playing_changed(&self, _event: &NowPlaying) {}

    /// Position or play/pause state changed.
    async fn playback_state_changed(&self, _event: &PlaybackState) {}

    async fn volume_changed(&self, _event: &VolumeChanged) {}

    async fn ad_state_changed(&self, _event: &AdStateChanged) {}

    /// An ad started playing.
    async fn ad_playing_changed(&self, _event: &AdPlayingChanged) {}

    async fn subtitles_track_changed(&self, _event: &SubtitlesTrackChanged) {}

    async fn autoplay_mode_changed(&self, _event: &AutoplayModeChanged) {}

    /// The video queued to play next changed.
    async fn autoplay_up_next_changed(&self, _event: &AutoplayUpNextChanged) {}

    async fn playback_speed_changed(&self, _event: &PlaybackSpeedChanged) {}

    /// The screen ended the session. The lounge token is already invalidated
    /// when this runs.
    async fn screen_disconnected(&self, _event: &ScreenDisconnected) {}

    async fn diagnostic(&self, _notice: &Diagnostic) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

#[async_trait]
impl EventListener for NoopListener {}

pub struct EventDispatcher {
    listener: RwLock<Arc<dyn EventListener>>,
    session: Arc<SessionManager>,
}

impl EventDispatcher {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self {
            listener: RwLock::new(Arc::new(NoopListener)),
            session,
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn EventListener>) {
        *self.listener.write().unwrap_or_else(PoisonError::into_inner) = listener;
    }

    fn listener(&self) -> Arc<dyn EventListener> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deliver one event. Disconnect-class events invalidate the lounge token
    /// before the listener sees them.
    pub async fn dispatch(&self, event: &Event) {
        let listener = self.listener();
        match event {
            Event::NowPlaying(e) => listener.now_playing_changed(e).await,
            Event::PlaybackState(e) => listener.playback_state_changed(e).await,
            Event::VolumeChanged(e) => listener.volume_changed(e).await,
            Event::AdStateChanged(e) => listener.ad_state_changed(e).await,
            Event::AdPlayingChanged(e) => listener.ad_playing_changed(e).await,
            Event::SubtitlesTrackChanged(e) => listener.subtitles_track_changed(e).await,
            Event::AutoplayModeChanged(e) => listener.autoplay_mode_changed(e).await,
            Event::AutoplayUpNextChanged(e) => listener.autoplay_up_next_changed(e).await,
            Event::PlaybackSpeedChanged(e) => listener.playback_speed_changed(e).await,
            Event::ScreenDisconnected(e) => {
                self.session.invalidate_token();
                listener.screen_disconnected(e).await
            }
        }
    }

    pub async fn diagnostic(&self, notice: Diagnostic) {
        self.listener().diagnostic(&notice).await;
    }
}
