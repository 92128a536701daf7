//! Short-lived state for joins awaiting their voice-server assignment.
//!
//! The assignment and the join timeout race to settle the same entry;
//! whoever removes the entry from the registry wins, which is the whole
//! mutual-exclusion story. An entry is settled exactly once and is gone
//! from the registry the moment it settles. Settlement paths that can
//! race a superseding join (the timeout task, a failed gateway send)
//! remove their entry through [`PendingJoinRegistry::take_if`], keyed by
//! the entry's token, so a stale path can never settle a newer join.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::JoinError;
use crate::node::VoiceNode;
use crate::pool::JoinOptions;
use crate::session::Session;

pub(crate) struct PendingJoin {
    pub channel_id: String,
    pub node: VoiceNode,
    /// Carried through a migration so the same session is re-homed instead
    /// of a fresh one being built.
    pub session: Option<Session>,
    pub options: JoinOptions,
    /// The join named a node or region explicitly; endpoint-region
    /// refinement must not rebind it.
    pub pinned: bool,
    /// Registry-issued identity of this entry, distinct across entries for
    /// the same guild.
    pub token: u64,
    tx: oneshot::Sender<Result<Session, JoinError>>,
    timeout: JoinHandle<()>,
}

impl PendingJoin {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel_id: String,
        node: VoiceNode,
        session: Option<Session>,
        options: JoinOptions,
        pinned: bool,
        token: u64,
        tx: oneshot::Sender<Result<Session, JoinError>>,
        timeout: JoinHandle<()>,
    ) -> Self {
        Self {
            channel_id,
            node,
            session,
            options,
            pinned,
            token,
            tx,
            timeout,
        }
    }

    pub fn cancel_timer(&self) {
        self.timeout.abort();
    }

    pub fn resolve(self, session: Session) {
        self.timeout.abort();
        let _ = self.tx.send(Ok(session));
    }

    pub fn reject(self, error: JoinError) {
        self.timeout.abort();
        let _ = self.tx.send(Err(error));
    }
}

/// Guild-keyed side table of pending joins. At most one entry per guild.
#[derive(Default)]
pub(crate) struct PendingJoinRegistry {
    entries: Mutex<HashMap<String, PendingJoin>>,
    counter: AtomicU64,
}

impl PendingJoinRegistry {
    /// Issue the token for a new entry.
    pub fn next_token(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a pending join, returning any displaced entry for the same
    /// guild so the caller can reject its waiter.
    pub fn insert(&self, guild_id: &str, pending: PendingJoin) -> Option<PendingJoin> {
        self.entries
            .lock()
            .expect("pending lock")
            .insert(guild_id.to_string(), pending)
    }

    /// Remove and return the entry; the caller owns settlement from here.
    pub fn take(&self, guild_id: &str) -> Option<PendingJoin> {
        self.entries.lock().expect("pending lock").remove(guild_id)
    }

    /// Remove the entry only if it is still the one identified by `token`.
    /// A superseding join replaces the entry under the same guild id; its
    /// predecessor's timeout and failure paths must not touch it.
    pub fn take_if(&self, guild_id: &str, token: u64) -> Option<PendingJoin> {
        let mut entries = self.entries.lock().expect("pending lock");
        if entries
            .get(guild_id)
            .is_some_and(|pending| pending.token == token)
        {
            entries.remove(guild_id)
        } else {
            None
        }
    }

    pub fn contains(&self, guild_id: &str) -> bool {
        self.entries
            .lock()
            .expect("pending lock")
            .contains_key(guild_id)
    }
}
