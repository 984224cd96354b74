//! Pairing, linking and lounge-token lifecycle.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::config::ClientConfig;
use crate::error::{LoungeError, Result};
use crate::transport::{HttpRequest, Transport, TransportError, TransportErrorKind};

/// Serialised `AuthState` layout version.
pub const AUTH_STATE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Screen {
    pub screen_id: String,
    pub name: String,
}

/// Credential for one screen. Replaced wholesale on refresh. The expiry is a
/// hint only; the server decides when a token is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoungeToken {
    pub value: String,
    pub expires_at: Option<SystemTime>,
}

impl LoungeToken {
    pub fn new(value: impl Into<String>, expires_at: Option<SystemTime>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub screen: Screen,
    pub token: LoungeToken,
    pub client_name: String,
    pub device_id: String,
}

/// Credentials handed to the caller for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthState {
    pub version: u32,
    pub screen: Option<Screen>,
    pub token: Option<LoungeToken>,
}

impl Default for AuthState {
    fn default() -> Self {
        Self {
            version: AUTH_STATE_VERSION,
            screen: None,
            token: None,
        }
    }
}

/// Hardware description the screen reports in `loungeStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    pub brand: String,
    pub model: String,
    pub os: String,
    #[serde(rename = "clientName")]
    pub client_name: String,
}

/// The `LOUNGE_SCREEN` entry of a `loungeStatus` device list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScreenStatus {
    pub name: String,
    pub client_name: Option<String>,
    pub device_info: Option<DeviceInfo>,
}

#[derive(Debug, Default)]
struct AuthInner {
    screen: Option<Screen>,
    token: Option<LoungeToken>,
    device_info: Option<DeviceInfo>,
}

// ---------------------------------------------------------------------------
// Pairing API payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScreenEntry {
    screen_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    lounge_token: Option<String>,
    #[serde(default)]
    expiration: Option<Value>,
}

impl ScreenEntry {
    fn token(&self) -> Option<LoungeToken> {
        let value = self.lounge_token.as_deref().filter(|t| !t.is_empty())?;
        Some(LoungeToken::new(value, expiry_from_millis(self.expiration.as_ref())))
    }
}

#[derive(Debug, Deserialize)]
struct GetScreenResponse {
    screen: Option<ScreenEntry>,
}

#[derive(Debug, Deserialize)]
struct TokenBatchResponse {
    #[serde(default)]
    screens: Vec<ScreenEntry>,
}

#[derive(Debug, Deserialize)]
struct AvailabilityResponse {
    #[serde(default)]
    screens: Vec<AvailabilityEntry>,
}

#[derive(Debug, Deserialize)]
struct AvailabilityEntry {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct LoungeDevice {
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "clientName")]
    client_name: Option<String>,
    #[serde(default, rename = "deviceInfo")]
    device_info: Option<String>,
}

fn expiry_from_millis(value: Option<&Value>) -> Option<SystemTime> {
    let millis = match value? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    UNIX_EPOCH.checked_add(Duration::from_millis(millis))
}

// ---------------------------------------------------------------------------
// SessionManager
// ---------------------------------------------------------------------------

pub struct SessionManager {
    transport: Arc<dyn Transport>,
    config: Arc<ClientConfig>,
    auth: RwLock<AuthInner>,
    /// Bumped on every successful refresh so a live channel re-handshakes.
    token_epoch: watch::Sender<u64>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, config: Arc<ClientConfig>) -> Self {
        let (token_epoch, _) = watch::channel(0);
        Self {
            transport,
            config,
            auth: RwLock::new(AuthInner::default()),
            token_epoch,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, AuthInner> {
        self.auth.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, AuthInner> {
        self.auth.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_paired(&self) -> bool {
        self.read().screen.is_some()
    }

    pub fn is_linked(&self) -> bool {
        let auth = self.read();
        auth.screen.is_some() && auth.token.is_some()
    }

    pub fn screen(&self) -> Option<Screen> {
        self.read().screen.clone()
    }

    pub fn token(&self) -> Option<LoungeToken> {
        self.read().token.clone()
    }

    pub fn session(&self) -> Option<Session> {
        let auth = self.read();
        Some(Session {
            screen: auth.screen.clone()?,
            token: auth.token.clone()?,
            client_name: self.config.device_name.clone(),
            device_id: self.config.device_id.clone(),
        })
    }

    /// Install credentials the caller persisted earlier.
    pub fn restore(&self, screen: Screen, token: Option<LoungeToken>) {
        let mut auth = self.write();
        auth.screen = Some(screen);
        auth.token = token;
        auth.device_info = None;
    }

    pub fn auth_state(&self) -> AuthState {
        let auth = self.read();
        AuthState {
            version: AUTH_STATE_VERSION,
            screen: auth.screen.clone(),
            token: auth.token.clone(),
        }
    }

    /// Returns false (and keeps the current state) for unknown versions.
    pub fn load_auth_state(&self, state: AuthState) -> bool {
        if state.version != AUTH_STATE_VERSION {
            tracing::warn!("[lounge] ignoring auth state version {}", state.version);
            return false;
        }
        let mut auth = self.write();
        auth.screen = state.screen;
        auth.token = state.token;
        auth.device_info = None;
        true
    }

    /// Drop the token after the server ended the session. The screen id is
    /// kept so `refresh_auth` can re-link.
    pub fn invalidate_token(&self) {
        if self.write().token.take().is_some() {
            tracing::info!("[lounge] lounge token invalidated");
        }
    }

    pub fn subscribe_token_epoch(&self) -> watch::Receiver<u64> {
        self.token_epoch.subscribe()
    }

    /// Exchange a code shown on the screen for its id and a token.
    pub async fn pair(&self, pairing_code: &str) -> Result<Session> {
        tracing::info!("[lounge] pairing with code {pairing_code}");
        let request = HttpRequest::post(self.config.pairing_url("get_screen"))
            .with_form(vec![("pairing_code".into(), pairing_code.trim().into())]);
        let resp = self.transport.send(request).await?;
        let status = resp.status;
        let body = resp.text().await?;
        if !(200..300).contains(&status) {
            tracing::warn!("[lounge] pairing rejected ({status}): {body}");
            return Err(LoungeError::NotPaired);
        }

        let parsed: GetScreenResponse = serde_json::from_str(&body).map_err(|e| {
            tracing::warn!("[lounge] unexpected pairing response: {e}");
            LoungeError::NotPaired
        })?;
        let entry = parsed.screen.ok_or(LoungeError::NotPaired)?;
        let token = entry.token().ok_or(LoungeError::NotPaired)?;

        let screen = Screen {
            screen_id: entry.screen_id,
            name: entry.name.unwrap_or_default(),
        };
        self.restore(screen, Some(token));
        tracing::info!("[lounge] paired with screen {:?}", self.read().screen);
        self.session().ok_or(LoungeError::NotPaired)
    }

    /// Obtain a token for a screen id that is already known (e.g. from DIAL).
    pub async fn link(&self, screen_id: &str, screen_name: Option<&str>) -> Result<Session> {
        let entry = self
            .fetch_token(screen_id)
            .await?
            .ok_or(LoungeError::NotLinked)?;
        let token = entry.token().ok_or(LoungeError::NotLinked)?;
        let name = screen_name
            .map(str::to_owned)
            .or(entry.name)
            .unwrap_or_default();
        self.restore(
            Screen {
                screen_id: entry.screen_id,
                name,
            },
            Some(token),
        );
        self.bump_epoch();
        self.session().ok_or(LoungeError::NotLinked)
    }

    /// Request a new token for the current screen. `Ok(false)` when the
    /// server no longer knows the screen. A 429 or 5xx answer is reported as
    /// `LoungeError::Transport` so callers can retry.
    pub async fn refresh_auth(&self) -> Result<bool> {
        let screen = self.screen().ok_or(LoungeError::NotPaired)?;
        let Some(entry) = self.fetch_token(&screen.screen_id).await? else {
            return Ok(false);
        };
        let Some(token) = entry.token() else {
            tracing::warn!("[lounge] refresh returned no token for {}", screen.screen_id);
            return Ok(false);
        };

        self.write().token = Some(token);
        self.bump_epoch();
        tracing::info!("[lounge] refreshed lounge token for {}", screen.screen_id);
        Ok(true)
    }

    async fn fetch_token(&self, screen_id: &str) -> Result<Option<ScreenEntry>> {
        let request = HttpRequest::post(self.config.pairing_url("get_lounge_token_batch"))
            .with_form(vec![("screen_ids".into(), screen_id.into())]);
        let resp = self.transport.send(request).await?;
        let status = resp.status;
        let body = resp.text().await?;
        if status == 429 || status >= 500 {
            tracing::warn!("[lounge] get_lounge_token_batch unavailable ({status}): {body}");
            return Err(TransportError::new(
                TransportErrorKind::Other,
                format!("get_lounge_token_batch returned {status}"),
            )
            .into());
        }
        if !(200..300).contains(&status) {
            tracing::warn!("[lounge] get_lounge_token_batch returned {status}: {body}");
            return Ok(None);
        }
        match serde_json::from_str::<TokenBatchResponse>(&body) {
            Ok(parsed) => Ok(parsed.screens.into_iter().next()),
            Err(e) => {
                tracing::warn!("[lounge] unexpected token batch response: {e}");
                Ok(None)
            }
        }
    }

    fn bump_epoch(&self) {
        self.token_epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Ask the server whether the screen is online.
    pub async fn is_available(&self) -> Result<bool> {
        let token = self.token().ok_or(LoungeError::NotLinked)?;
        let request = HttpRequest::post(self.config.pairing_url("get_screen_availability"))
            .with_form(vec![("lounge_token".into(), token.value)]);
        let resp = self.transport.send(request).await?;
        if !resp.is_success() {
            return Ok(false);
        }
        let body = resp.text().await?;
        let parsed: AvailabilityResponse = serde_json::from_str(&body)
            .map_err(|e| LoungeError::Protocol(format!("availability response: {e}")))?;
        Ok(parsed
            .screens
            .first()
            .is_some_and(|s| s.status == "online"))
    }

    /// Record what a `loungeStatus` entry says about the screen and return it.
    pub fn apply_lounge_status(&self, payload: &Value) -> Option<ScreenStatus> {
        let devices: Vec<LoungeDevice> = match payload.get("devices")? {
            Value::String(raw) => serde_json::from_str(raw).ok()?,
            other => serde_json::from_value(other.clone()).ok()?,
        };
        let device = devices.into_iter().find(|d| d.kind == "LOUNGE_SCREEN")?;
        let device_info = device
            .device_info
            .as_deref()
            .and_then(|raw| serde_json::from_str::<DeviceInfo>(raw).ok());

        let mut auth = self.write();
        if let Some(screen) = auth.screen.as_mut() {
            screen.name = device.name.clone();
        }
        auth.device_info = device_info.clone();

        Some(ScreenStatus {
            name: device.name,
            client_name: device.client_name,
            device_info,
        })
    }

    pub fn screen_name(&self) -> Option<String> {
        self.read().screen.as_ref().map(|s| s.name.clone())
    }

    /// `"<brand> <model>"` once a handshake reported device info.
    pub fn screen_device_name(&self) -> Option<String> {
        self.read()
            .device_info
            .as_ref()
            .map(|info| format!("{} {}", info.brand, info.model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ReqwestTransport;
    use serde_json::json;

    fn manager() -> SessionManager {
        let transport = Arc::new(ReqwestTransport::with_client(
            reqwest::Client::new(),
            Duration::from_secs(1),
        ));
        SessionManager::new(transport, Arc::new(ClientConfig::new("Tester")))
    }

    fn lg_status() -> Value {
        let devices = json!([
            {
                "app": "lb-v4",
                "clientName": "tvhtml5",
                "name": "YouTube on TV",
                "type": "LOUNGE_SCREEN",
                "deviceInfo": "{\"brand\":\"LG\",\"model\":\"OLED55C7V-Z\",\"os\":\"webOS\",\"clientName\":\"TVHTML5\"}"
            },
            {
                "app": "web",
                "name": "Test",
                "type": "REMOTE_CONTROL"
            }
        ]);
        json!({ "devices": devices.to_string() })
    }

    #[test]
    fn lounge_status_updates_screen_details() {
        let session = manager();
        session.restore(
            Screen {
                screen_id: "abc".into(),
                name: String::new(),
            },
            Some(LoungeToken::new("tok", None)),
        );
        let status = session.apply_lounge_status(&lg_status()).unwrap();
        assert_eq!(status.name, "YouTube on TV");
        assert_eq!(status.client_name.as_deref(), Some("tvhtml5"));
        assert_eq!(session.screen_name().as_deref(), Some("YouTube on TV"));
        assert_eq!(session.screen_device_name().as_deref(), Some("LG OLED55C7V-Z"));
    }

    #[test]
    fn lounge_status_without_device_info() {
        let session = manager();
        let devices = json!([{ "name": "Nintendo Switch", "type": "LOUNGE_SCREEN" }]);
        let status = session
            .apply_lounge_status(&json!({ "devices": devices.to_string() }))
            .unwrap();
        assert_eq!(status.name, "Nintendo Switch");
        assert_eq!(status.device_info, None);
        assert_eq!(session.screen_device_name(), None);
    }

    #[test]
    fn auth_state_round_trip_and_version_check() {
        let session = manager();
        session.restore(
            Screen {
                screen_id: "abc".into(),
                name: "TV".into(),
            },
            Some(LoungeToken::new("tok1", None)),
        );
        let saved = serde_json::to_string(&session.auth_state()).unwrap();

        let other = manager();
        let state: AuthState = serde_json::from_str(&saved).unwrap();
        assert!(other.load_auth_state(state.clone()));
        assert!(other.is_linked());

        let stale = AuthState {
            version: 0,
            ..state
        };
        assert!(!manager().load_auth_state(stale));
    }

    #[test]
    fn expiry_parses_millis() {
        let at = expiry_from_millis(Some(&json!(1_000))).unwrap();
        assert_eq!(at, UNIX_EPOCH + Duration::from_secs(1));
        assert_eq!(expiry_from_millis(Some(&json!("2000"))), UNIX_EPOCH.checked_add(Duration::from_secs(2)));
        assert_eq!(expiry_from_millis(None), None);
    }

    #[tokio::test]
    async fn refresh_requires_pairing() {
        let err = manager().refresh_auth().await.unwrap_err();
        assert!(matches!(err, LoungeError::NotPaired));
    }
}
