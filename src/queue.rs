//! Outbound command batching.
//!
//! Commands are sent as soon as they arrive unless a batch is already in
//! flight; anything submitted meanwhile is coalesced, in arrival order, into
//! the next batch.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::connection::{Connection, ConnectionState};
use crate::error::{Failure, LoungeError, Result};
use crate::messages::{encode_commands, Command};
use crate::policy::{FailureClass, ReconnectPolicy};
use crate::transport::HttpRequest;

struct Pending {
    command: Command,
    ack: oneshot::Sender<bool>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Pending>,
    flushing: bool,
}

struct Shared {
    connection: Arc<Connection>,
    state: Mutex<QueueState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct CommandQueue {
    shared: Arc<Shared>,
}

impl CommandQueue {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            shared: Arc::new(Shared {
                connection,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Send a command. Resolves to whether the screen accepted the batch
    /// carrying it; `false` if the channel was lost before it went out.
    pub async fn submit(&self, command: Command) -> Result<bool> {
        if self.shared.connection.state() != ConnectionState::Connected {
            return Err(LoungeError::NotConnected);
        }

        let (ack, done) = oneshot::channel();
        let start_flush = {
            let mut state = self.shared.lock();
            state.pending.push_back(Pending { command, ack });
            !std::mem::replace(&mut state.flushing, true)
        };
        if start_flush {
            tokio::spawn(flush(self.shared.clone()));
        }
        Ok(done.await.unwrap_or(false))
    }
}

async fn flush(shared: Arc<Shared>) {
    loop {
        let batch: Vec<Pending> = {
            let mut state = shared.lock();
            if state.pending.is_empty() {
                state.flushing = false;
                return;
            }
            state.pending.drain(..).collect()
        };

        let commands: Vec<Command> = batch.iter().map(|p| p.command.clone()).collect();
        let accepted = send_batch(&shared.connection, &commands).await;
        for pending in batch {
            let _ = pending.ack.send(accepted);
        }
    }
}

async fn send_batch(connection: &Connection, commands: &[Command]) -> bool {
    if connection.state() != ConnectionState::Connected {
        tracing::debug!("[lounge] dropping {} command(s): channel not connected", commands.len());
        return false;
    }

    let ticket = connection.tracker().reserve_batch();
    let query = match connection.channel_query(&ticket.seq.rid.to_string(), ticket.seq.aid) {
        Ok(query) => query,
        Err(e) => {
            tracing::debug!("[lounge] dropping command batch: {e}");
            return false;
        }
    };
    let form = encode_commands(commands, &ticket.seq);
    let request = HttpRequest::post(connection.bind_url())
        .with_query(query)
        .with_form(form);

    let names: Vec<&str> = commands.iter().map(|c| c.name.as_str()).collect();
    tracing::debug!(
        "[lounge] sending {names:?} (RID={}, ofs={})",
        ticket.seq.rid,
        ticket.seq.ofs
    );

    let Some(sent) = connection.until_closed(connection.transport().send(request)).await else {
        tracing::debug!("[lounge] command batch cancelled by close");
        return false;
    };
    let resp = match sent {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!("[lounge] command batch failed: {e}");
            return false;
        }
    };

    let status = resp.status;
    let success = resp.is_success();
    let body = resp.text().await.unwrap_or_default();
    if success {
        return connection.tracker().commit_batch(&ticket, commands.len());
    }

    tracing::warn!("[lounge] command batch rejected ({status}): {body}");
    let failure = Failure::Status { status, body };
    match ReconnectPolicy::classify(&failure) {
        FailureClass::Transient { rebind: false } => {}
        _ => connection.report_fault(failure),
    }
    false
}
