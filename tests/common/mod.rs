#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::Notify;

use ytlounge::events::{NowPlaying, PlaybackState, ScreenDisconnected, VolumeChanged};
use ytlounge::session::AUTH_STATE_VERSION;
use ytlounge::transport::{HttpRequest, HttpResponse, Method, Transport, TransportError};
use ytlounge::{AuthState, ClientConfig, Diagnostic, EventListener, LoungeClient, LoungeToken, Screen};

pub const API_BASE: &str = "http://lounge.test/api/lounge";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Pair,
    TokenBatch,
    Availability,
    Handshake,
    Poll,
    Command,
    Terminate,
}

pub enum Reply {
    Body { status: u16, body: String },
    /// Poll body delivered chunk by chunk. With `hang` the stream stays open.
    Stream { chunks: Vec<String>, hang: bool },
    /// 200 once the gate is notified.
    Gate(Arc<Notify>),
    Fail(TransportError),
}

impl Reply {
    pub fn status(status: u16, body: &str) -> Self {
        Reply::Body {
            status,
            body: body.to_owned(),
        }
    }

    pub fn ok(body: impl Into<String>) -> Self {
        Reply::Body {
            status: 200,
            body: body.into(),
        }
    }
}

/// Length-prefix a JSON chunk the way the bind endpoint does.
pub fn frame(json: &str) -> String {
    format!("{}\n{}", json.encode_utf16().count(), json)
}

pub fn handshake_body(sid: &str, gsessionid: &str) -> String {
    frame(&format!(r#"[[0,["c","{sid}","",8]],[0,["S","{gsessionid}"]],[0,["noop"]]]"#))
}

pub fn lounge_status(client_name: &str) -> String {
    let devices = serde_json::json!([
        {"type": "LOUNGE_SCREEN", "name": "Kids TV", "clientName": client_name},
        {"type": "REMOTE_CONTROL", "name": "Test Remote"}
    ]);
    serde_json::json!({ "devices": devices.to_string() }).to_string()
}

pub struct MockTransport {
    replies: Mutex<HashMap<Kind, VecDeque<Reply>>>,
    log: Mutex<Vec<(Kind, HttpRequest)>>,
    handshakes: Mutex<u32>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            handshakes: Mutex::new(0),
        })
    }

    pub fn push(&self, kind: Kind, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push_back(reply);
    }

    pub fn requests(&self, kind: Kind) -> Vec<HttpRequest> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn count(&self, kind: Kind) -> usize {
        self.requests(kind).len()
    }

    fn classify(request: &HttpRequest) -> Kind {
        if request.url.ends_with("/pairing/get_screen") {
            Kind::Pair
        } else if request.url.ends_with("/pairing/get_lounge_token_batch") {
            Kind::TokenBatch
        } else if request.url.ends_with("/pairing/get_screen_availability") {
            Kind::Availability
        } else if request.method == Method::Get {
            Kind::Poll
        } else if request.form_field("TYPE") == Some("terminate") {
            Kind::Terminate
        } else if request.form_field("count").is_some() {
            Kind::Command
        } else {
            Kind::Handshake
        }
    }

    fn default_reply(&self, kind: Kind) -> Reply {
        match kind {
            Kind::Handshake => {
                let mut n = self.handshakes.lock().unwrap();
                *n += 1;
                Reply::ok(handshake_body(&format!("sid{n}"), &format!("gs{n}")))
            }
            Kind::Poll => Reply::Stream {
                chunks: Vec::new(),
                hang: true,
            },
            Kind::Command | Kind::Terminate => Reply::ok(""),
            _ => Reply::status(404, "Not Found"),
        }
    }
}

fn body_response(status: u16, chunks: Vec<String>, hang: bool) -> HttpResponse {
    let items: Vec<Result<Bytes, TransportError>> =
        chunks.into_iter().map(|c| Ok(Bytes::from(c))).collect();
    let stream = futures_util::stream::iter(items);
    let body = if hang {
        stream.chain(futures_util::stream::pending()).boxed()
    } else {
        stream.boxed()
    };
    HttpResponse {
        status,
        headers: Vec::new(),
        body,
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let kind = Self::classify(&request);
        self.log.lock().unwrap().push((kind, request));
        let queued = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&kind)
            .and_then(VecDeque::pop_front);
        let reply = match queued {
            Some(reply) => reply,
            None => self.default_reply(kind),
        };
        match reply {
            Reply::Body { status, body } => Ok(body_response(status, vec![body], false)),
            Reply::Stream { chunks, hang } => Ok(body_response(200, chunks, hang)),
            Reply::Gate(gate) => {
                gate.notified().await;
                Ok(body_response(200, Vec::new(), false))
            }
            Reply::Fail(e) => Err(e),
        }
    }
}

#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<String>>,
    pub diagnostics: Mutex<Vec<Diagnostic>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventListener for Recorder {
    async fn now_playing_changed(&self, event: &NowPlaying) {
        self.events
            .lock()
            .unwrap()
            .push(format!("now_playing {:?}", event.video_id));
    }

    async fn playback_state_changed(&self, event: &PlaybackState) {
        self.events
            .lock()
            .unwrap()
            .push(format!("playback_state {}", event.current_time));
    }

    async fn volume_changed(&self, event: &VolumeChanged) {
        self.events
            .lock()
            .unwrap()
            .push(format!("volume {}", event.volume));
    }

    async fn screen_disconnected(&self, _event: &ScreenDisconnected) {
        self.events.lock().unwrap().push("screen_disconnected".into());
    }

    async fn diagnostic(&self, notice: &Diagnostic) {
        if let Diagnostic::UnknownEvent { name } = notice {
            self.events.lock().unwrap().push(format!("unknown {name}"));
        }
        self.diagnostics.lock().unwrap().push(notice.clone());
    }
}

pub fn config() -> ClientConfig {
    ClientConfig {
        api_base: API_BASE.into(),
        device_id: "remote-1".into(),
        ..ClientConfig::new("Test Remote")
    }
}

pub fn client(transport: Arc<MockTransport>) -> (LoungeClient, Arc<Recorder>) {
    init_tracing();
    let client = LoungeClient::with_transport(config(), transport);
    let recorder = Arc::new(Recorder::default());
    client.set_listener(recorder.clone());
    (client, recorder)
}

/// Client already holding credentials for screen `abc`.
pub fn linked_client(transport: Arc<MockTransport>) -> (LoungeClient, Arc<Recorder>) {
    let (client, recorder) = client(transport);
    assert!(client.load_auth_state(AuthState {
        version: AUTH_STATE_VERSION,
        screen: Some(Screen {
            screen_id: "abc".into(),
            name: "Living Room".into(),
        }),
        token: Some(LoungeToken::new("tok1", None)),
    }));
    (client, recorder)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` while letting other tasks run.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
