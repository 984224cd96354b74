//! Typed notifications decoded from bind-channel entries.
//!
//! Payload values arrive as JSON strings (`"currentTime":"5.2"`) most of the
//! time, occasionally as bare numbers or booleans; the field helpers accept
//! both. Missing fields fall back to neutral values rather than failing the
//! whole poll response.

use serde_json::Value;

/// Playback state codes reported by the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Stopped,
    /// Seen between videos.
    Buffering,
    Playing,
    Paused,
    Starting,
    Advertisement,
}

impl PlaybackStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(PlaybackStatus::Stopped),
            0 => Some(PlaybackStatus::Buffering),
            1 => Some(PlaybackStatus::Playing),
            2 => Some(PlaybackStatus::Paused),
            3 => Some(PlaybackStatus::Starting),
            1081 => Some(PlaybackStatus::Advertisement),
            _ => None,
        }
    }

    /// Unknown or missing codes are treated as stopped.
    fn parse(value: Option<&Value>) -> Self {
        let Some(value) = value else {
            return PlaybackStatus::Stopped;
        };
        let code = match value {
            Value::String(s) => s.trim().parse::<i64>().ok(),
            Value::Number(n) => n.as_i64(),
            _ => None,
        };
        match code.and_then(PlaybackStatus::from_code) {
            Some(status) => status,
            None => {
                tracing::warn!("unknown playback state {value}, assuming stopped");
                PlaybackStatus::Stopped
            }
        }
    }
}

/// `https://img.youtube.com/vi/<id>/<idx>.jpg`
pub fn thumbnail_url(video_id: &str, thumbnail_idx: u8) -> String {
    format!("https://img.youtube.com/vi/{video_id}/{thumbnail_idx}.jpg")
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NowPlaying {
    pub video_id: Option<String>,
    pub current_time: Option<f64>,
    pub duration: Option<f64>,
    pub state: PlaybackStatus,
    pub list_id: Option<String>,
}

impl NowPlaying {
    pub fn thumbnail_url(&self, thumbnail_idx: u8) -> Option<String> {
        self.video_id
            .as_deref()
            .map(|id| thumbnail_url(id, thumbnail_idx))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlaybackState {
    pub current_time: f64,
    pub duration: f64,
    pub loaded_time: Option<f64>,
    pub state: PlaybackStatus,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct VolumeChanged {
    pub volume: u32,
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AdStateChanged {
    pub ad_state: PlaybackStatus,
    pub current_time: f64,
    pub is_skip_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AdPlayingChanged {
    pub ad_video_id: Option<String>,
    pub ad_video_uri: Option<String>,
    pub ad_title: String,
    pub is_bumper: bool,
    pub is_skippable: bool,
    pub is_skip_enabled: bool,
    pub click_through_url: String,
    pub ad_system: String,
    pub ad_next_params: String,
    pub remote_slots_data: Option<String>,
    pub ad_state: PlaybackStatus,
    pub content_video_id: String,
    pub duration: f64,
    pub current_time: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubtitlesTrackChanged {
    pub video_id: String,
    pub track_name: Option<String>,
    pub language_code: Option<String>,
    pub source_language_code: Option<String>,
    pub language_name: Option<String>,
    pub kind: Option<String>,
    pub vss_id: Option<String>,
    pub caption_id: Option<String>,
    pub style: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AutoplayModeChanged {
    pub enabled: bool,
    pub supported: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AutoplayUpNextChanged {
    pub video_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlaybackSpeedChanged {
    pub playback_speed: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScreenDisconnected {
    pub reason: Option<String>,
}

/// Every notification a listener can receive.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    NowPlaying(NowPlaying),
    PlaybackState(PlaybackState),
    VolumeChanged(VolumeChanged),
    AdStateChanged(AdStateChanged),
    AdPlayingChanged(AdPlayingChanged),
    SubtitlesTrackChanged(SubtitlesTrackChanged),
    AutoplayModeChanged(AutoplayModeChanged),
    AutoplayUpNextChanged(AutoplayUpNextChanged),
    PlaybackSpeedChanged(PlaybackSpeedChanged),
    ScreenDisconnected(ScreenDisconnected),
}

impl Event {
    /// Map a wire event name and payload to a typed event. Names outside the
    /// known set return `None`.
    pub fn from_wire(name: &str, payload: &Value) -> Option<Event> {
        let event = match name {
            "nowPlaying" => Event::NowPlaying(NowPlaying {
                video_id: field_string(payload, "videoId"),
                current_time: field_f64(payload, "currentTime"),
                duration: field_f64(payload, "duration"),
                state: PlaybackStatus::parse(payload.get("state")),
                list_id: field_string(payload, "listId"),
            }),
            "onStateChange" => Event::PlaybackState(PlaybackState {
                current_time: field_f64(payload, "currentTime").unwrap_or(0.0),
                duration: field_f64(payload, "duration").unwrap_or(0.0),
                loaded_time: field_f64(payload, "loadedTime"),
                state: PlaybackStatus::parse(payload.get("state")),
            }),
            "onVolumeChanged" => Event::VolumeChanged(VolumeChanged {
                volume: field_f64(payload, "volume").map_or(0, |v| v.clamp(0.0, 100.0) as u32),
                muted: field_bool(payload, "muted"),
            }),
            "onAdStateChange" => Event::AdStateChanged(AdStateChanged {
                ad_state: PlaybackStatus::parse(payload.get("adState")),
                current_time: field_f64(payload, "currentTime").unwrap_or(0.0),
                is_skip_enabled: field_bool(payload, "isSkipEnabled"),
            }),
            "adPlaying" => Event::AdPlayingChanged(AdPlayingChanged {
                ad_video_id: field_string(payload, "adVideoId"),
                ad_video_uri: field_string(payload, "adVideoUri"),
                ad_title: field_string(payload, "adTitle").unwrap_or_default(),
                is_bumper: field_bool(payload, "isBumper"),
                is_skippable: field_bool(payload, "isSkippable"),
                is_skip_enabled: field_bool(payload, "isSkipEnabled"),
                click_through_url: field_string(payload, "clickThroughUrl").unwrap_or_default(),
                ad_system: field_string(payload, "adSystem").unwrap_or_default(),
                ad_next_params: field_string(payload, "adNextParams").unwrap_or_default(),
                remote_slots_data: field_string(payload, "remoteSlotsData"),
                ad_state: PlaybackStatus::parse(payload.get("adState")),
                content_video_id: field_string(payload, "contentVideoId").unwrap_or_default(),
                duration: field_f64(payload, "duration").unwrap_or(0.0),
                current_time: field_f64(payload, "currentTime").unwrap_or(0.0),
            }),
            "onSubtitlesTrackChanged" => Event::SubtitlesTrackChanged(SubtitlesTrackChanged {
                video_id: field_string(payload, "videoId").unwrap_or_default(),
                track_name: field_string(payload, "trackName"),
                language_code: field_string(payload, "languageCode"),
                source_language_code: field_string(payload, "sourceLanguageCode"),
                language_name: field_string(payload, "languageName"),
                kind: field_string(payload, "kind"),
                vss_id: field_string(payload, "vss_id"),
                caption_id: field_string(payload, "captionId"),
                style: field_string(payload, "style"),
            }),
            "onAutoplayModeChanged" => {
                let mode = field_string(payload, "autoplayMode").unwrap_or_default();
                Event::AutoplayModeChanged(AutoplayModeChanged {
                    enabled: mode == "ENABLED",
                    supported: mode != "UNSUPPORTED",
                })
            }
            "autoplayUpNext" => Event::AutoplayUpNextChanged(AutoplayUpNextChanged {
                video_id: field_string(payload, "videoId"),
            }),
            "onPlaybackSpeedChanged" => Event::PlaybackSpeedChanged(PlaybackSpeedChanged {
                playback_speed: field_f64(payload, "playbackSpeed").unwrap_or(1.0),
            }),
            "loungeScreenDisconnected" => Event::ScreenDisconnected(ScreenDisconnected {
                reason: field_string(payload, "reason"),
            }),
            _ => return None,
        };
        Some(event)
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn field_string(payload: &Value, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn field_f64(payload: &Value, key: &str) -> Option<f64> {
    match payload.get(key)? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn field_bool(payload: &Value, key: &str) -> bool {
    match payload.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true",
        _ => false,
    }
}
