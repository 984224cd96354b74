//! Bind-channel state machine: handshake, long-poll loop, reconnection.
//!
//! ```text
//! Unpaired ──pair/link──> Linked ──connect()──> Connecting ──handshake──> Connected
//!                           ^                       ^                         │
//!                           │ NotSupported          └──── ReconnectPolicy ────┤
//!                           └───────────────────────────────────────── Disconnected
//! ```
//!
//! One task runs the poll loop (`subscribe`); it is the only reader of the
//! streamed poll body. Command batches go out concurrently through the
//! `CommandQueue`, sharing the `SequenceTracker` with the loop.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::time;

use crate::config::ClientConfig;
use crate::error::{Failure, LoungeError, Result};
use crate::events::{Event, ScreenDisconnected};
use crate::listener::{Diagnostic, EventDispatcher};
use crate::messages::{decode_chunk_stream, zx, ChunkDecoder, DecodeError, WireEvent};
use crate::policy::{FailureClass, ReconnectPolicy};
use crate::sequence::SequenceTracker;
use crate::session::{ScreenStatus, SessionManager};
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// Screen clients that accept a channel but cannot be driven.
const UNSUPPORTED_CLIENTS: &[&str] = &["YouTube TV Kids", "YouTube Kids"];

const DISCONNECT_REASON: &str = "MDX_SESSION_DISCONNECT_REASON_DISCONNECTED_BY_USER";

/// Result of one network exchange: `Err` means retryable, classified later.
type Attempt<T> = std::result::Result<T, Failure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unpaired,
    Linked,
    Connecting,
    Connected,
    Disconnected,
}

/// Why `subscribe` returned without an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// `close()` or `disconnect()` was called.
    Closed,
    /// The screen ended the session; the token has been invalidated.
    ScreenDisconnected(ScreenDisconnected),
}

#[derive(Debug, Clone, Default)]
struct ChannelIds {
    sid: String,
    gsessionid: String,
}

enum PollOutcome {
    /// Server closed the stream or it went idle: poll again.
    Ended,
    Closed,
    TokenChanged,
    ScreenDisconnected(ScreenDisconnected),
    Failed(Failure),
}

enum Recovery {
    Retry,
    Rebind,
    Closed,
}

pub struct Connection {
    transport: Arc<dyn Transport>,
    config: Arc<ClientConfig>,
    session: Arc<SessionManager>,
    dispatcher: Arc<EventDispatcher>,
    tracker: Arc<SequenceTracker>,
    ids: Mutex<Option<ChannelIds>>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
    /// Fault seen by the command path that the poll loop must act on.
    fault: Mutex<Option<Failure>>,
    fault_notify: Notify,
    /// Held by the running poll loop.
    poll_lock: tokio::sync::Mutex<()>,
}

impl Connection {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: Arc<ClientConfig>,
        session: Arc<SessionManager>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        let initial_rid = rand::thread_rng().gen_range(10_000..100_000);
        let initial_state = if session.is_linked() {
            ConnectionState::Linked
        } else {
            ConnectionState::Unpaired
        };
        let (state, _) = watch::channel(initial_state);
        let (shutdown, _) = watch::channel(false);
        Self {
            transport,
            config,
            session,
            dispatcher,
            tracker: Arc::new(SequenceTracker::new(initial_rid)),
            ids: Mutex::new(None),
            state,
            shutdown,
            fault: Mutex::new(None),
            fault_notify: Notify::new(),
            poll_lock: tokio::sync::Mutex::new(()),
        }
    }

    // -- state ---------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::info!("[lounge] state {prev:?} -> {next:?}");
        }
    }

    /// Pairing or linking succeeded.
    pub(crate) fn mark_linked(&self) {
        if matches!(
            self.state(),
            ConnectionState::Unpaired | ConnectionState::Disconnected
        ) {
            self.set_state(ConnectionState::Linked);
        }
    }

    pub fn tracker(&self) -> &Arc<SequenceTracker> {
        &self.tracker
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn bind_url(&self) -> String {
        self.config.bind_url()
    }

    fn ids(&self) -> MutexGuard<'_, Option<ChannelIds>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clear_channel(&self) {
        self.ids().take();
    }

    /// Query parameters shared by every request on an established channel.
    pub(crate) fn channel_query(&self, rid: &str, aid: i64) -> Result<Vec<(String, String)>> {
        let token = self.session.token().ok_or(LoungeError::NotLinked)?;
        let ids = self.ids().clone().ok_or(LoungeError::NotConnected)?;
        Ok(vec![
            ("name".into(), self.config.device_name.clone()),
            ("loungeIdToken".into(), token.value),
            ("SID".into(), ids.sid),
            ("AID".into(), aid.to_string()),
            ("gsessionid".into(), ids.gsessionid),
            ("device".into(), "REMOTE_CONTROL".into()),
            ("app".into(), "youtube-desktop".into()),
            ("VER".into(), "8".into()),
            ("v".into(), "2".into()),
            ("RID".into(), rid.into()),
            ("zx".into(), zx()),
        ])
    }

    /// Hand a command-path fault to the poll loop.
    pub(crate) fn report_fault(&self, failure: Failure) {
        *self.fault.lock().unwrap_or_else(PoisonError::into_inner) = Some(failure);
        self.fault_notify.notify_one();
    }

    fn take_fault(&self) -> Option<Failure> {
        self.fault.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Run `fut` unless the connection is closed first.
    pub(crate) async fn until_closed<F: Future>(&self, fut: F) -> Option<F::Output> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return None;
        }
        tokio::select! {
            biased;
            _ = wait_closed(&mut shutdown) => None,
            out = fut => Some(out),
        }
    }

    // -- connect ---------------------------------------------------------------

    /// Open the channel. Transient failures are retried per the policy;
    /// returns once the handshake's snapshot has been delivered.
    pub async fn connect(&self) -> Result<()> {
        if !self.session.is_linked() {
            return Err(LoungeError::NotLinked);
        }
        let busy = matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        );
        if busy || self.poll_lock.try_lock().is_err() {
            return Err(LoungeError::Protocol("channel is already open".into()));
        }
        self.shutdown.send_replace(false);
        self.take_fault();

        let mut policy = ReconnectPolicy::from_config(&self.config);
        match self.establish(&mut policy).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(LoungeError::NotConnected),
            Err(e) => Err(e),
        }
    }

    /// Handshake until connected. `Ok(false)` when closed meanwhile.
    async fn establish(&self, policy: &mut ReconnectPolicy) -> Result<bool> {
        loop {
            if !self.session.is_linked() {
                self.set_state(ConnectionState::Disconnected);
                return Err(LoungeError::NotLinked);
            }
            self.set_state(ConnectionState::Connecting);

            let failure = match self.handshake().await {
                Ok(Some(Ok(()))) => {
                    self.set_state(ConnectionState::Connected);
                    return Ok(true);
                }
                Ok(Some(Err(failure))) => failure,
                Ok(None) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(false);
                }
                Err(LoungeError::NotSupported(client)) => {
                    self.clear_channel();
                    self.set_state(ConnectionState::Linked);
                    return Err(LoungeError::NotSupported(client));
                }
                Err(e) => {
                    self.clear_channel();
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            };

            tracing::warn!("[lounge] handshake failed: {failure}");
            match self.recover(failure, policy).await {
                Ok(Recovery::Retry | Recovery::Rebind) => continue,
                Ok(Recovery::Closed) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(false);
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
            }
        }
    }

    /// One bind handshake. `None` if closed mid-way.
    async fn handshake(&self) -> Result<Option<Attempt<()>>> {
        let token = self.session.token().ok_or(LoungeError::NotLinked)?;
        let rid = self.tracker.next_rid();

        let query = vec![
            ("RID".into(), rid.to_string()),
            ("VER".into(), "8".into()),
            ("CVER".into(), "1".into()),
            ("auth_failure_option".into(), "send_error".into()),
            ("zx".into(), zx()),
        ];
        let form = vec![
            ("app".into(), "web".into()),
            ("mdx-version".into(), "3".into()),
            ("name".into(), self.config.device_name.clone()),
            ("id".into(), self.config.device_id.clone()),
            ("device".into(), "REMOTE_CONTROL".into()),
            ("capabilities".into(), "que,dsdtr,atp".into()),
            ("method".into(), "setPlaylist".into()),
            ("magnaKey".into(), "cloudPairedDevice".into()),
            ("ui".into(), "false".into()),
            (
                "deviceContext".into(),
                "user_agent=dunno&window_width_points=&window_height_points=&os_name=android&ms=".into(),
            ),
            ("theme".into(), "cl".into()),
            ("loungeIdToken".into(), token.value),
        ];
        let request = HttpRequest::post(self.bind_url())
            .with_query(query)
            .with_form(form);

        tracing::debug!("[lounge] handshake RID={rid}");
        let Some(sent) = self.until_closed(self.transport.send(request)).await else {
            return Ok(None);
        };
        let resp = match sent {
            Ok(resp) => resp,
            Err(e) => return Ok(Some(Err(e.into()))),
        };
        let Some(read) = self.until_closed(read_body(resp)).await else {
            return Ok(None);
        };
        let body = match read {
            Ok(body) => body,
            Err(failure) => return Ok(Some(Err(failure))),
        };
        let events = match decode_chunk_stream(&body) {
            Ok(events) => events,
            Err(e) => return Ok(Some(Err(e.into()))),
        };

        let mut ids = ChannelIds::default();
        for entry in &events {
            match entry.name.as_str() {
                "c" => ids.sid = entry.payload_str().unwrap_or_default().to_owned(),
                "S" => ids.gsessionid = entry.payload_str().unwrap_or_default().to_owned(),
                _ => {}
            }
        }
        if ids.sid.is_empty() || ids.gsessionid.is_empty() {
            return Ok(Some(Err(Failure::Decode(DecodeError::Schema(
                "handshake did not return SID and gsessionid".into(),
            )))));
        }

        let highest = events.iter().map(|e| e.array_id).max().unwrap_or(-1);
        let generation = self.tracker.begin_generation(highest);
        tracing::info!(
            "[lounge] channel bound: SID={}, gsession={}, AID={highest}, generation={generation}",
            ids.sid,
            ids.gsessionid
        );
        *self.ids() = Some(ids);

        // Prime the listener with the snapshot before reporting success. A
        // denylisted screen fails here, before the state becomes Connected.
        if let Some(disconnect) = self.process_entries(&events).await? {
            tracing::warn!("[lounge] screen disconnected during handshake: {disconnect:?}");
            return Err(LoungeError::NotLinked);
        }
        Ok(Some(Ok(())))
    }

    // -- poll loop -------------------------------------------------------------

    /// Run the poll loop until the channel terminates.
    ///
    /// Transient faults are retried (with re-handshakes as needed) and only
    /// reported through `Diagnostic`s. Returns `Ok` for an explicit close or
    /// a screen-initiated disconnect, `Err` for terminal failures.
    pub async fn subscribe(&self) -> Result<Termination> {
        let Ok(_poll_guard) = self.poll_lock.try_lock() else {
            return Err(LoungeError::Protocol("a poll loop is already running".into()));
        };
        if self.state() != ConnectionState::Connected {
            return Err(LoungeError::NotConnected);
        }

        let mut policy = ReconnectPolicy::from_config(&self.config);
        let mut epoch = self.session.subscribe_token_epoch();
        epoch.borrow_and_update();
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow_and_update() {
                return Ok(self.finish_closed());
            }

            let outcome = match self.poll_once(&mut shutdown, &mut epoch, &mut policy).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.clear_channel();
                    self.set_state(if matches!(e, LoungeError::NotSupported(_)) {
                        ConnectionState::Linked
                    } else {
                        ConnectionState::Disconnected
                    });
                    tracing::error!("[lounge] channel terminated: {e}");
                    return Err(e);
                }
            };
            let rebind = match outcome {
                PollOutcome::Ended => false,
                PollOutcome::Closed => return Ok(self.finish_closed()),
                PollOutcome::ScreenDisconnected(event) => {
                    tracing::info!("[lounge] screen disconnected: {:?}", event.reason);
                    self.clear_channel();
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(Termination::ScreenDisconnected(event));
                }
                PollOutcome::TokenChanged => {
                    tracing::info!("[lounge] lounge token replaced, re-binding channel");
                    true
                }
                PollOutcome::Failed(failure) => {
                    tracing::warn!("[lounge] poll failed: {failure}");
                    match self.recover(failure, &mut policy).await {
                        Ok(Recovery::Retry) => false,
                        Ok(Recovery::Rebind) => true,
                        Ok(Recovery::Closed) => return Ok(self.finish_closed()),
                        Err(e) => {
                            self.clear_channel();
                            self.set_state(ConnectionState::Disconnected);
                            tracing::error!("[lounge] channel terminated: {e}");
                            return Err(e);
                        }
                    }
                }
            };

            if rebind {
                // The previous poll body is already dropped here, so the new
                // generation never overlaps a reader of the old one.
                self.clear_channel();
                self.set_state(ConnectionState::Disconnected);
                if !self.establish(&mut policy).await? {
                    return Ok(self.finish_closed());
                }
                epoch.borrow_and_update();
                self.dispatcher
                    .diagnostic(Diagnostic::Reconnected {
                        generation: self.tracker.generation(),
                    })
                    .await;
            }
        }
    }

    fn finish_closed(&self) -> Termination {
        self.clear_channel();
        self.set_state(ConnectionState::Disconnected);
        Termination::Closed
    }

    async fn poll_once(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        epoch: &mut watch::Receiver<u64>,
        policy: &mut ReconnectPolicy,
    ) -> Result<PollOutcome> {
        let aid = self.tracker.snapshot().aid;
        let mut query = self.channel_query("rpc", aid)?;
        query.push(("CI".into(), "0".into()));
        query.push(("TYPE".into(), "xmlhttp".into()));
        let request = HttpRequest::get(self.bind_url()).with_query(query).streaming();

        tracing::debug!("[lounge] poll starting (AID={aid})");
        let sent = tokio::select! {
            biased;
            _ = wait_closed(shutdown) => return Ok(PollOutcome::Closed),
            _ = epoch.changed() => return Ok(PollOutcome::TokenChanged),
            _ = self.fault_notify.notified() => match self.take_fault() {
                Some(failure) => return Ok(PollOutcome::Failed(failure)),
                None => return Ok(PollOutcome::Ended),
            },
            sent = self.transport.send(request) => sent,
        };

        let resp = match sent {
            Ok(resp) => resp,
            Err(e) => return Ok(PollOutcome::Failed(e.into())),
        };
        if !resp.is_success() {
            let status = resp.status;
            let body = resp.text().await.unwrap_or_default();
            return Ok(PollOutcome::Failed(Failure::Status { status, body }));
        }

        let idle = Duration::from_secs(self.config.poll_idle_timeout_secs);
        let mut body = resp.body;
        let mut decoder = ChunkDecoder::new();

        loop {
            tokio::select! {
                biased;
                _ = wait_closed(shutdown) => return Ok(PollOutcome::Closed),
                _ = epoch.changed() => return Ok(PollOutcome::TokenChanged),
                _ = self.fault_notify.notified() => {
                    if let Some(failure) = self.take_fault() {
                        return Ok(PollOutcome::Failed(failure));
                    }
                }
                next = time::timeout(idle, body.next()) => match next {
                    Err(_) => {
                        tracing::trace!("[lounge] poll idle timeout");
                        return Ok(PollOutcome::Ended);
                    }
                    Ok(None) => {
                        tracing::debug!("[lounge] poll stream closed by server");
                        return Ok(match decoder.finish() {
                            Ok(_) => {
                                policy.reset();
                                PollOutcome::Ended
                            }
                            Err(e) => PollOutcome::Failed(e.into()),
                        });
                    }
                    Ok(Some(Err(e))) => return Ok(PollOutcome::Failed(e.into())),
                    Ok(Some(Ok(bytes))) => {
                        let events = match decoder.feed(&bytes) {
                            Ok(events) => events,
                            Err(e) => return Ok(PollOutcome::Failed(e.into())),
                        };
                        if !events.is_empty() {
                            tracing::debug!("[lounge] poll: {} entries received", events.len());
                            policy.reset();
                        }
                        if let Some(event) = self.process_entries(&events).await? {
                            return Ok(PollOutcome::ScreenDisconnected(event));
                        }
                    }
                },
            }
        }
    }

    /// Apply entries in delivery order, acknowledging each once handled.
    async fn process_entries(&self, events: &[WireEvent]) -> Result<Option<ScreenDisconnected>> {
        for entry in events {
            match entry.name.as_str() {
                "c" => {
                    if let (Some(sid), Some(ids)) = (entry.payload_str(), self.ids().as_mut()) {
                        ids.sid = sid.to_owned();
                    }
                }
                "S" => {
                    if let (Some(gsid), Some(ids)) = (entry.payload_str(), self.ids().as_mut()) {
                        ids.gsessionid = gsid.to_owned();
                    }
                }
                "noop" => {}
                "loungeStatus" => {
                    if let Some(status) = self.session.apply_lounge_status(entry.payload()) {
                        check_supported(&status)?;
                    }
                }
                name => match Event::from_wire(name, entry.payload()) {
                    Some(Event::ScreenDisconnected(event)) => {
                        let wrapped = Event::ScreenDisconnected(event.clone());
                        self.dispatcher.dispatch(&wrapped).await;
                        self.tracker.acknowledge(entry.array_id);
                        return Ok(Some(event));
                    }
                    Some(event) => self.dispatcher.dispatch(&event).await,
                    None => {
                        tracing::debug!("[lounge] unhandled event {name} args={:?}", entry.args);
                        self.dispatcher
                            .diagnostic(Diagnostic::UnknownEvent {
                                name: name.to_owned(),
                            })
                            .await;
                    }
                },
            }
            self.tracker.acknowledge(entry.array_id);
        }
        Ok(None)
    }

    /// Decide what a failure means for the channel, sleeping for transient ones.
    async fn recover(&self, failure: Failure, policy: &mut ReconnectPolicy) -> Result<Recovery> {
        match ReconnectPolicy::classify(&failure) {
            FailureClass::NotFound => {
                tracing::error!("[lounge] screen or session not found: {failure}");
                self.session.invalidate_token();
                Err(LoungeError::NotLinked)
            }
            FailureClass::AuthExpired => {
                self.clear_channel();
                match self.session.refresh_auth().await {
                    Ok(true) => {
                        self.dispatcher.diagnostic(Diagnostic::TokenRefreshed).await;
                        // A token that is rejected again right after a refresh
                        // still consumes the budget.
                        if policy.record_failure().is_none() {
                            return Err(self.exhausted(policy, &failure));
                        }
                        Ok(Recovery::Rebind)
                    }
                    Ok(false) => {
                        tracing::error!("[lounge] token refresh rejected, screen must be re-linked");
                        self.session.invalidate_token();
                        Err(LoungeError::NotLinked)
                    }
                    Err(LoungeError::Transport(e)) => {
                        tracing::warn!("[lounge] token refresh failed: {e}");
                        self.backoff(policy, &failure, true).await
                    }
                    Err(e) => Err(e),
                }
            }
            FailureClass::Transient { rebind } => self.backoff(policy, &failure, rebind).await,
        }
    }

    async fn backoff(
        &self,
        policy: &mut ReconnectPolicy,
        failure: &Failure,
        rebind: bool,
    ) -> Result<Recovery> {
        let Some(delay) = policy.record_failure() else {
            return Err(self.exhausted(policy, failure));
        };
        let attempt = policy.attempts();
        tracing::debug!("[lounge] backoff {}ms (attempt {attempt})", delay.as_millis());
        self.dispatcher
            .diagnostic(Diagnostic::Retrying { attempt, delay })
            .await;

        match self.until_closed(time::sleep(delay)).await {
            Some(()) if rebind => Ok(Recovery::Rebind),
            Some(()) => Ok(Recovery::Retry),
            None => Ok(Recovery::Closed),
        }
    }

    fn exhausted(&self, policy: &ReconnectPolicy, failure: &Failure) -> LoungeError {
        tracing::error!("[lounge] retry budget exhausted after {} attempts", policy.attempts());
        LoungeError::Connection {
            attempts: policy.attempts(),
            last: failure.to_string(),
        }
    }

    // -- teardown --------------------------------------------------------------

    /// Tell the screen this remote is leaving, then close the channel.
    pub async fn disconnect(&self) -> Result<bool> {
        if self.state() != ConnectionState::Connected {
            return Err(LoungeError::NotConnected);
        }
        let rid = self.tracker.next_rid();
        let mut query = self.channel_query(&rid.to_string(), self.tracker.snapshot().aid)?;
        query.push(("CVER".into(), "1".into()));
        query.push(("auth_failure_option".into(), "send_error".into()));
        let form = vec![
            ("ui".into(), String::new()),
            ("TYPE".into(), "terminate".into()),
            ("clientDisconnectReason".into(), DISCONNECT_REASON.into()),
        ];
        let request = HttpRequest::post(self.bind_url())
            .with_query(query)
            .with_form(form);

        let result = self.transport.send(request).await;
        self.close();
        let resp = result?;
        let ok = resp.is_success();
        if !ok {
            tracing::warn!("[lounge] terminate returned {}", resp.status);
        }
        Ok(ok)
    }

    /// Cancel the poll loop and any pending sends. No reconnect follows.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
        self.clear_channel();
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            self.set_state(ConnectionState::Disconnected);
        }
    }
}

async fn wait_closed(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|closed| *closed).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn read_body(resp: HttpResponse) -> Attempt<Vec<u8>> {
    let status = resp.status;
    let success = resp.is_success();
    let body = resp.bytes().await.map_err(Failure::from)?;
    if !success {
        return Err(Failure::Status {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }
    Ok(body)
}

fn check_supported(status: &ScreenStatus) -> Result<()> {
    let candidates = [Some(status.name.as_str()), status.client_name.as_deref()];
    for client in candidates.into_iter().flatten() {
        if UNSUPPORTED_CLIENTS
            .iter()
            .any(|denied| denied.eq_ignore_ascii_case(client))
        {
            tracing::error!("[lounge] screen client {client:?} is not supported");
            return Err(LoungeError::NotSupported(client.to_owned()));
        }
    }
    Ok(())
}
