//-
// Copyright (c) 2024, the Wingmap authors
//
// This file is part of Wingmap.
//
// Wingmap is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Wingmap is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied warranty of  MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Wingmap. If not, see <http://www.gnu.org/licenses/>.

//! The change-notification engine.
//!
//! Changes are made durable as journal entries; the in-process half of the
//! notifier is nothing more than a registry of wake channels keyed by
//! `(user, mailbox path)`. A mutating command appends its entries, then
//! fires the mailbox; each selected session drains the journal itself by
//! modseq range at its next untagged-response opportunity.
//!
//! Delivery is at-least-once: a session may be woken spuriously or may
//! observe an entry twice across overlapping drains. De-duplication by
//! entry id happens in the session state, not here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::warn;
use tokio::sync::mpsc;

use crate::storage::{
    JournalEntry, MailboxId, SessionId, Storage, UserId,
};
use crate::support::error::Error;

/// A wake signal for one selected session.
///
/// The channel is bounded at one element and sent with `try_send`, so any
/// number of fires between two drains coalesce into a single wake-up and a
/// slow session can never block the firing command.
pub type WakeReceiver = mpsc::Receiver<()>;

struct Subscriber {
    session: SessionId,
    wake: mpsc::Sender<()>,
    /// The modseq this session has drained through, for journal trimming.
    drained: u64,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    subscribers: Mutex<HashMap<(UserId, String), Vec<Subscriber>>>,
}

impl SubscriptionRegistry {
    /// Register `session` as selected on `(user, path)` and return its
    /// wake channel.
    ///
    /// Re-subscribing an existing session (e.g. SELECT while already
    /// selected) replaces the previous registration.
    pub fn subscribe(
        &self,
        user: UserId,
        path: &str,
        session: SessionId,
    ) -> WakeReceiver {
        let (tx, rx) = mpsc::channel(1);
        let mut subscribers = self.subscribers.lock().unwrap();
        let entries =
            subscribers.entry((user, path.to_owned())).or_default();
        entries.retain(|s| s.session != session);
        entries.push(Subscriber {
            session,
            wake: tx,
            drained: 0,
        });
        rx
    }

    pub fn unsubscribe(
        &self,
        user: UserId,
        path: &str,
        session: SessionId,
    ) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(entries) =
            subscribers.get_mut(&(user, path.to_owned()))
        {
            entries.retain(|s| s.session != session);
            if entries.is_empty() {
                subscribers.remove(&(user, path.to_owned()));
            }
        }
    }

    /// Wake every session selected on `(user, path)`.
    ///
    /// The senders are collected under the lock but the sends happen
    /// outside it.
    pub fn fire(&self, user: UserId, path: &str) {
        let wakes: Vec<mpsc::Sender<()>> = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers
                .get(&(user, path.to_owned()))
                .map(|entries| {
                    entries.iter().map(|s| s.wake.clone()).collect()
                })
                .unwrap_or_default()
        };

        for wake in wakes {
            // A full channel means a wake-up is already pending, which is
            // all we need; a closed one means the session is going away.
            let _ = wake.try_send(());
        }
    }

    /// Record how far `session` has drained, and return the minimum drain
    /// watermark across all sessions on the mailbox, if any are
    /// registered.
    pub fn note_drained(
        &self,
        user: UserId,
        path: &str,
        session: SessionId,
        modseq: u64,
    ) -> Option<u64> {
        let mut subscribers = self.subscribers.lock().unwrap();
        let entries = subscribers.get_mut(&(user, path.to_owned()))?;
        for entry in entries.iter_mut() {
            if entry.session == session {
                entry.drained = entry.drained.max(modseq);
            }
        }
        entries.iter().map(|s| s.drained).min()
    }
}

pub struct Notifier {
    storage: Arc<Storage>,
    registry: SubscriptionRegistry,
}

impl Notifier {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            registry: SubscriptionRegistry::default(),
        }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Persist journal entries for a mailbox in a single unordered batch.
    ///
    /// This must complete before the mutating command's tagged OK so that
    /// any session which subsequently fires-and-drains observes the
    /// entries.
    pub async fn add_entries(
        &self,
        entries: &[JournalEntry],
    ) -> Result<(), Error> {
        self.storage.append_journal(entries).await
    }

    /// Wake every other session selected on the mailbox so they drain the
    /// journal at their next opportunity.
    pub fn fire(&self, user: UserId, path: &str) {
        self.registry.fire(user, path);
    }

    /// Record a session's drain progress and opportunistically trim the
    /// journal below the slowest session's watermark.
    ///
    /// Trimming is best-effort cleanup: a failure is logged and swallowed;
    /// the next drain retries.
    pub async fn note_drained(
        &self,
        user: UserId,
        path: &str,
        mailbox: MailboxId,
        session: SessionId,
        modseq: u64,
    ) {
        let Some(watermark) =
            self.registry.note_drained(user, path, session, modseq)
        else {
            return;
        };

        if watermark > 0 {
            if let Err(e) = self
                .storage
                .trim_journal(
                    mailbox,
                    crate::account::model::Modseq::of(watermark),
                )
                .await
            {
                warn!("journal trim failed for {}: {}", path, e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use mongodb::bson::oid::ObjectId;

    use super::*;

    fn user() -> UserId {
        UserId(ObjectId::new())
    }

    #[test]
    fn fire_wakes_all_subscribers_once() {
        let registry = SubscriptionRegistry::default();
        let user = user();
        let mut rx1 = registry.subscribe(user, "INBOX", SessionId(1));
        let mut rx2 = registry.subscribe(user, "INBOX", SessionId(2));

        registry.fire(user, "INBOX");
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx1.try_recv().is_err());
    }

    #[test]
    fn fires_coalesce_between_drains() {
        let registry = SubscriptionRegistry::default();
        let user = user();
        let mut rx = registry.subscribe(user, "INBOX", SessionId(1));

        registry.fire(user, "INBOX");
        registry.fire(user, "INBOX");
        registry.fire(user, "INBOX");

        assert!(rx.try_recv().is_ok());
        // All three fires collapsed into the single buffered wake-up.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fire_is_scoped_to_the_mailbox_and_user() {
        let registry = SubscriptionRegistry::default();
        let alice = user();
        let berta = user();
        let mut inbox = registry.subscribe(alice, "INBOX", SessionId(1));
        let mut archive =
            registry.subscribe(alice, "Archive", SessionId(2));
        let mut other = registry.subscribe(berta, "INBOX", SessionId(3));

        registry.fire(alice, "INBOX");
        assert!(inbox.try_recv().is_ok());
        assert!(archive.try_recv().is_err());
        assert!(other.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_stops_wakeups() {
        let registry = SubscriptionRegistry::default();
        let user = user();
        let mut rx = registry.subscribe(user, "INBOX", SessionId(1));
        registry.unsubscribe(user, "INBOX", SessionId(1));

        registry.fire(user, "INBOX");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn resubscribe_replaces_previous_channel() {
        let registry = SubscriptionRegistry::default();
        let user = user();
        let mut old = registry.subscribe(user, "INBOX", SessionId(1));
        let mut new = registry.subscribe(user, "INBOX", SessionId(1));

        registry.fire(user, "INBOX");
        assert!(old.try_recv().is_err());
        assert!(new.try_recv().is_ok());
    }

    #[test]
    fn drain_watermark_is_minimum_across_sessions() {
        let registry = SubscriptionRegistry::default();
        let user = user();
        let _rx1 = registry.subscribe(user, "INBOX", SessionId(1));
        let _rx2 = registry.subscribe(user, "INBOX", SessionId(2));

        assert_eq!(
            Some(0),
            registry.note_drained(user, "INBOX", SessionId(1), 10),
        );
        assert_eq!(
            Some(7),
            registry.note_drained(user, "INBOX", SessionId(2), 7),
        );
        assert_eq!(
            Some(7),
            registry.note_drained(user, "INBOX", SessionId(1), 12),
        );
    }
}
