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

//! The per-session model of the selected mailbox.
//!
//! The snapshot is nothing but the ascending UID list; a message's
//! sequence number is its index plus one. Everything durable is keyed by
//! UID, and the sequence-number fiction is maintained here, at the edge,
//! by replaying journal entries against the snapshot at well-defined
//! protocol moments.
//!
//! The rules for those moments are strict. Pending entries are flushed
//! between the untagged responses of the current command and its tagged
//! completion, in the order EXISTS (low UID first), then FETCH, then
//! EXPUNGE (high sequence number first, so that each emitted number is
//! valid against the client's current mapping). Commands that stream
//! message data (FETCH/STORE/SEARCH) only permit a "mini" flush that
//! leaves the sequence-number mapping untouched.

use std::collections::HashSet;

use crate::account::model::{Flag, Modseq, SeqRange, Seqnum, Uid};
use crate::storage::{
    JournalCommand, JournalEntry, JournalId, MailboxId, SessionId, UserId,
};
use crate::support::error::Error;

pub struct SelectedMailbox {
    id: MailboxId,
    user: UserId,
    path: String,
    session: SessionId,
    read_only: bool,
    /// The snapshot: UIDs currently known to this session, ascending.
    /// Sequence numbers are indices-plus-one into this vector.
    uids: Vec<Uid>,
    /// The modseq this session has drained the journal through.
    highest_modseq_seen: Modseq,
    /// Journal entries observed but not yet flushed to the client.
    pending: Vec<JournalEntry>,
    /// Entry ids recently offered, for at-least-once de-duplication.
    recently_seen: HashSet<JournalId>,
}

/// One `* N FETCH (FLAGS …)` notification ready for emission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchEcho {
    pub seqnum: Seqnum,
    pub uid: Uid,
    pub flags: Vec<Flag>,
    pub modseq: Modseq,
}

/// The ordered emission plan produced by a flush.
///
/// Fields are in transmission order: every EXISTS count, then every FETCH
/// echo, then every EXPUNGE. The expunge sequence numbers are already
/// relative to the evolving client view, i.e. each is valid at the moment
/// its line is written.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushPlan {
    pub exists: Vec<usize>,
    pub fetch: Vec<FetchEcho>,
    pub expunge: Vec<(Seqnum, Uid)>,
}

impl FlushPlan {
    pub fn is_empty(&self) -> bool {
        self.exists.is_empty()
            && self.fetch.is_empty()
            && self.expunge.is_empty()
    }
}

impl SelectedMailbox {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: MailboxId,
        user: UserId,
        path: String,
        session: SessionId,
        read_only: bool,
        uids: Vec<Uid>,
        highest_modseq: Modseq,
    ) -> Self {
        debug_assert!(uids.windows(2).all(|w| w[0] < w[1]));
        Self {
            id,
            user,
            path,
            session,
            read_only,
            uids,
            highest_modseq_seen: highest_modseq,
            pending: Vec::new(),
            recently_seen: HashSet::new(),
        }
    }

    pub fn id(&self) -> MailboxId {
        self.id
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn require_writable(&self) -> Result<(), Error> {
        if self.read_only {
            Err(Error::MailboxReadOnly)
        } else {
            Ok(())
        }
    }

    pub fn exists(&self) -> usize {
        self.uids.len()
    }

    /// The modseq this session has reported through, i.e. its current
    /// `HIGHESTMODSEQ` as far as the client knows.
    pub fn snapshot_modseq(&self) -> Modseq {
        self.highest_modseq_seen
    }

    /// The largest sequence number, as a raw count (`0` when empty). Used
    /// as the `*` substitute when parsing sequence sets.
    pub fn max_seqnum(&self) -> u32 {
        self.uids.len() as u32
    }

    /// The largest known UID, used as the `*` substitute in UID sets.
    pub fn max_uid(&self) -> Uid {
        self.uids.last().copied().unwrap_or(Uid::MIN)
    }

    pub fn contains_uid(&self, uid: Uid) -> bool {
        self.uids.binary_search(&uid).is_ok()
    }

    pub fn seqnum_of(&self, uid: Uid) -> Option<Seqnum> {
        self.uids
            .binary_search(&uid)
            .ok()
            .map(Seqnum::from_index)
    }

    pub fn uid_of(&self, seqnum: Seqnum) -> Option<Uid> {
        self.uids.get(seqnum.to_index()).copied()
    }

    /// Translate a sequence-number set into the corresponding UIDs.
    ///
    /// Referencing a sequence number beyond the snapshot is a protocol
    /// violation and reports `BAD` (via `Error::BadSeqnum`).
    pub fn seqnum_range_to_uids(
        &self,
        seqnums: &SeqRange<Seqnum>,
    ) -> Result<SeqRange<Uid>, Error> {
        if seqnums.max().unwrap_or(0) > self.uids.len() as u32 {
            return Err(Error::BadSeqnum);
        }

        let mut uids = SeqRange::new();
        for seqnum in seqnums.items(self.max_seqnum()) {
            uids.append(self.uids[seqnum.to_index()]);
        }
        Ok(uids)
    }

    /// Translate UIDs back into sequence numbers, silently dropping UIDs
    /// not present in the snapshot (RFC 3501 ignores nonexistent UIDs).
    pub fn uid_range_to_seqnums(
        &self,
        uids: &SeqRange<Uid>,
    ) -> SeqRange<Seqnum> {
        let mut seqnums = SeqRange::new();
        for uid in uids.items(u32::from(self.max_uid())) {
            if let Some(seqnum) = self.seqnum_of(uid) {
                seqnums.append(seqnum);
            }
        }
        seqnums
    }

    /// The UIDs from `uids` present in the snapshot, ascending.
    pub fn uids_in(&self, uids: &SeqRange<Uid>) -> Vec<Uid> {
        uids.items(u32::from(self.max_uid()))
            .filter(|&u| self.contains_uid(u))
            .collect()
    }

    /// The whole snapshot, for search translation.
    pub fn snapshot(&self) -> &[Uid] {
        &self.uids
    }

    /// Remove `uid` from the snapshot as part of this session's own
    /// EXPUNGE stream, returning the sequence number to emit.
    pub fn expunge_own(&mut self, uid: Uid) -> Option<Seqnum> {
        let ix = self.uids.binary_search(&uid).ok()?;
        self.uids.remove(ix);
        Some(Seqnum::from_index(ix))
    }

    /// Offer journal entries observed from a drain.
    ///
    /// Entries for other mailboxes, entries already seen (at-least-once
    /// delivery), and entries this session itself produced (`ignore`)
    /// are discarded here. The drain watermark advances over every offered
    /// entry regardless of whether it survives the filter.
    pub fn offer_entries(&mut self, entries: Vec<JournalEntry>) {
        for entry in entries {
            if entry.mailbox != self.id {
                continue;
            }
            self.highest_modseq_seen =
                self.highest_modseq_seen.max(entry.modseq);
            if !self.recently_seen.insert(entry.id) {
                continue;
            }
            if Some(self.session) == entry.ignore {
                continue;
            }
            self.pending.push(entry);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Produce the emission plan for a mini flush: only `FETCH` echoes for
    /// messages in the current snapshot. EXISTS and EXPUNGE entries stay
    /// queued, since reporting them would change the sequence-number
    /// mapping under a command that is addressing by it.
    pub fn flush_mini(&mut self) -> FlushPlan {
        let mut plan = FlushPlan::default();
        let mut kept = Vec::new();

        let pending = std::mem::take(&mut self.pending);
        let expunging: HashSet<Uid> = pending
            .iter()
            .filter(|e| JournalCommand::Expunge == e.command)
            .map(|e| e.uid)
            .collect();

        for entry in pending {
            if JournalCommand::Fetch == entry.command {
                if expunging.contains(&entry.uid) {
                    // Pointless to echo flags for a message whose expunge
                    // is already queued.
                    continue;
                }
                match self.seqnum_of(entry.uid) {
                    Some(seqnum) => {
                        push_fetch_echo(&mut plan.fetch, seqnum, entry);
                    }
                    // Not in the snapshot yet; its EXISTS is still queued,
                    // so defer the echo alongside it.
                    None => kept.push(entry),
                }
            } else {
                kept.push(entry);
            }
        }

        self.pending = kept;
        plan
    }

    /// Produce the emission plan for a full flush, updating the snapshot.
    ///
    /// All pending entries are consumed. New messages are spliced into the
    /// snapshot in UID order; expunged messages are removed highest-first
    /// so that the emitted sequence numbers, interpreted against the
    /// client's shifting view, are each correct at their moment of
    /// emission.
    pub fn flush_full(&mut self) -> FlushPlan {
        let mut plan = FlushPlan::default();
        let pending = std::mem::take(&mut self.pending);
        self.recently_seen.clear();

        let mut new_uids: Vec<Uid> = Vec::new();
        let mut fetches: Vec<JournalEntry> = Vec::new();
        let mut expunged: Vec<Uid> = Vec::new();

        for entry in pending {
            match entry.command {
                JournalCommand::Exists => {
                    if !self.contains_uid(entry.uid) {
                        new_uids.push(entry.uid);
                    }
                }
                JournalCommand::Fetch => fetches.push(entry),
                JournalCommand::Expunge => expunged.push(entry.uid),
            }
        }

        // EXISTS, low UID first.
        new_uids.sort_unstable();
        new_uids.dedup();
        for uid in new_uids {
            match self.uids.binary_search(&uid) {
                Ok(_) => continue,
                Err(ix) => self.uids.insert(ix, uid),
            }
            plan.exists.push(self.uids.len());
        }

        // FETCH, resolved against the post-EXISTS, pre-EXPUNGE mapping.
        // A message that is both fetched and expunged in the same batch
        // yields only the EXPUNGE.
        expunged.sort_unstable();
        expunged.dedup();
        for entry in fetches {
            if expunged.binary_search(&entry.uid).is_ok() {
                continue;
            }
            if let Some(seqnum) = self.seqnum_of(entry.uid) {
                push_fetch_echo(&mut plan.fetch, seqnum, entry);
            }
        }

        // EXPUNGE, high sequence number first.
        for &uid in expunged.iter().rev() {
            if let Ok(ix) = self.uids.binary_search(&uid) {
                self.uids.remove(ix);
                plan.expunge.push((Seqnum::from_index(ix), uid));
            }
        }

        plan
    }
}

/// Insert or supersede a `FETCH` echo: multiple flag updates to one
/// message within a batch collapse to the latest.
fn push_fetch_echo(
    fetches: &mut Vec<FetchEcho>,
    seqnum: Seqnum,
    entry: JournalEntry,
) {
    let echo = FetchEcho {
        seqnum,
        uid: entry.uid,
        flags: entry.flags.unwrap_or_default(),
        modseq: entry.modseq,
    };

    if let Some(existing) =
        fetches.iter_mut().find(|f| f.uid == echo.uid)
    {
        if echo.modseq >= existing.modseq {
            *existing = echo;
        }
    } else {
        fetches.push(echo);
    }
}

#[cfg(test)]
mod test {
    use mongodb::bson::oid::ObjectId;
    use proptest::prelude::*;

    use super::*;
    use crate::account::model::Flag;

    fn selected(uids: &[u32]) -> SelectedMailbox {
        SelectedMailbox::new(
            MailboxId(ObjectId::new()),
            UserId(ObjectId::new()),
            "INBOX".to_owned(),
            SessionId(42),
            false,
            uids.iter().copied().map(Uid::u).collect(),
            Modseq::of(1),
        )
    }

    fn entry(
        mb: &SelectedMailbox,
        command: JournalCommand,
        uid: u32,
        modseq: u64,
    ) -> JournalEntry {
        JournalEntry::new(mb.id(), command, Uid::u(uid), Modseq::of(modseq))
    }

    #[test]
    fn seqnum_mapping_is_position_plus_one() {
        let mb = selected(&[10, 11, 12]);
        assert_eq!(Some(Seqnum::u(2)), mb.seqnum_of(Uid::u(11)));
        assert_eq!(Some(Uid::u(12)), mb.uid_of(Seqnum::u(3)));
        assert_eq!(None, mb.seqnum_of(Uid::u(13)));
        assert_eq!(None, mb.uid_of(Seqnum::u(4)));
    }

    #[test]
    fn seqnum_range_beyond_snapshot_is_rejected() {
        let mb = selected(&[10, 11]);
        assert_matches!(
            Err(Error::BadSeqnum),
            mb.seqnum_range_to_uids(&SeqRange::just(Seqnum::u(3)))
        );

        let uids = mb
            .seqnum_range_to_uids(&SeqRange::range(
                Seqnum::u(1),
                Seqnum::u(2),
            ))
            .unwrap();
        assert_eq!("10:11", uids.to_string());
    }

    #[test]
    fn unknown_uids_are_silently_dropped() {
        let mb = selected(&[10, 12]);
        let seqnums = mb.uid_range_to_seqnums(&SeqRange::parse(
            "10:12",
            Uid::u(12),
        )
        .unwrap());
        assert_eq!("1:2", seqnums.to_string());
    }

    #[test]
    fn cross_session_flag_change_is_echoed_with_current_seqnum() {
        // Scenario: two messages exist; another session stores \Seen on
        // the second. This session must see `* 2 FETCH (FLAGS (\Seen))`.
        let mut mb = selected(&[1, 2]);
        let mut e = entry(&mb, JournalCommand::Fetch, 2, 5);
        e.flags = Some(vec![Flag::Seen]);
        mb.offer_entries(vec![e]);

        let plan = mb.flush_mini();
        assert_eq!(
            vec![FetchEcho {
                seqnum: Seqnum::u(2),
                uid: Uid::u(2),
                flags: vec![Flag::Seen],
                modseq: Modseq::of(5),
            }],
            plan.fetch,
        );
        assert_eq!(Modseq::of(5), mb.snapshot_modseq());
    }

    #[test]
    fn own_changes_are_suppressed() {
        let mut mb = selected(&[1, 2]);
        let mut own = entry(&mb, JournalCommand::Fetch, 1, 5);
        own.ignore = Some(mb.session());
        let mut other = entry(&mb, JournalCommand::Fetch, 2, 6);
        other.ignore = Some(SessionId(7));
        mb.offer_entries(vec![own, other]);

        let plan = mb.flush_mini();
        assert_eq!(1, plan.fetch.len());
        assert_eq!(Uid::u(2), plan.fetch[0].uid);
        // The watermark still advances over the suppressed entry.
        assert_eq!(Modseq::of(6), mb.snapshot_modseq());
    }

    #[test]
    fn duplicate_deliveries_are_deduplicated_by_entry_id() {
        let mut mb = selected(&[1]);
        let mut e = entry(&mb, JournalCommand::Fetch, 1, 5);
        e.flags = Some(vec![Flag::Flagged]);
        mb.offer_entries(vec![e.clone()]);
        mb.offer_entries(vec![e]);

        let plan = mb.flush_mini();
        assert_eq!(1, plan.fetch.len());
    }

    #[test]
    fn expunge_of_middle_message_shifts_later_seqnums() {
        // UIDs [10, 11, 12]; UID 11 is expunged elsewhere. The protocol
        // line is `* 2 EXPUNGE`, after which UID 12 is sequence number 2.
        let mut mb = selected(&[10, 11, 12]);
        mb.offer_entries(vec![entry(
            &mb,
            JournalCommand::Expunge,
            11,
            9,
        )]);

        let plan = mb.flush_full();
        assert_eq!(vec![(Seqnum::u(2), Uid::u(11))], plan.expunge);
        assert_eq!(2, mb.exists());
        assert_eq!(Some(Seqnum::u(2)), mb.seqnum_of(Uid::u(12)));
    }

    #[test]
    fn exists_are_reported_before_fetch_before_expunge() {
        let mut mb = selected(&[1, 2, 3]);
        let mut fetch = entry(&mb, JournalCommand::Fetch, 3, 11);
        fetch.flags = Some(vec![Flag::Seen]);
        mb.offer_entries(vec![
            entry(&mb, JournalCommand::Expunge, 1, 10),
            fetch,
            entry(&mb, JournalCommand::Exists, 4, 12),
        ]);

        let plan = mb.flush_full();
        // The new message is appended first, so EXISTS reports 4...
        assert_eq!(vec![4], plan.exists);
        // ...the flag echo is resolved against the post-append map...
        assert_eq!(Seqnum::u(3), plan.fetch[0].seqnum);
        // ...and the expunge of UID 1 comes last.
        assert_eq!(vec![(Seqnum::u(1), Uid::u(1))], plan.expunge);
        assert_eq!(
            vec![Uid::u(2), Uid::u(3), Uid::u(4)],
            mb.snapshot().to_vec(),
        );
    }

    #[test]
    fn exists_entries_arriving_out_of_uid_order_are_sorted() {
        let mut mb = selected(&[1, 2]);
        mb.offer_entries(vec![
            entry(&mb, JournalCommand::Exists, 4, 11),
            entry(&mb, JournalCommand::Exists, 3, 12),
        ]);

        let plan = mb.flush_full();
        assert_eq!(vec![3, 4], plan.exists);
        assert_eq!(Some(Seqnum::u(3)), mb.seqnum_of(Uid::u(3)));
        assert_eq!(Some(Seqnum::u(4)), mb.seqnum_of(Uid::u(4)));
    }

    #[test]
    fn fetch_for_expunged_message_is_dropped() {
        let mut mb = selected(&[1, 2]);
        let mut fetch = entry(&mb, JournalCommand::Fetch, 2, 10);
        fetch.flags = Some(vec![Flag::Deleted]);
        mb.offer_entries(vec![
            fetch,
            entry(&mb, JournalCommand::Expunge, 2, 11),
        ]);

        let plan = mb.flush_full();
        assert!(plan.fetch.is_empty());
        assert_eq!(vec![(Seqnum::u(2), Uid::u(2))], plan.expunge);
    }

    #[test]
    fn mini_flush_defers_existence_changes() {
        let mut mb = selected(&[1]);
        let mut fetch = entry(&mb, JournalCommand::Fetch, 1, 10);
        fetch.flags = Some(vec![Flag::Seen]);
        mb.offer_entries(vec![
            entry(&mb, JournalCommand::Exists, 2, 11),
            entry(&mb, JournalCommand::Expunge, 1, 12),
            fetch,
        ]);

        let plan = mb.flush_mini();
        // The flag echo for UID 1 is suppressed because UID 1 is pending
        // expunge; nothing else may be reported mid-stream.
        assert!(plan.is_empty());
        assert_eq!(1, mb.exists());
        assert!(mb.has_pending());

        let plan = mb.flush_full();
        assert_eq!(vec![2], plan.exists);
        assert_eq!(vec![(Seqnum::u(1), Uid::u(1))], plan.expunge);
        assert_eq!(vec![Uid::u(2)], mb.snapshot().to_vec());
    }

    #[test]
    fn repeated_flag_updates_collapse_to_latest() {
        let mut mb = selected(&[1]);
        let mut first = entry(&mb, JournalCommand::Fetch, 1, 10);
        first.flags = Some(vec![Flag::Seen]);
        let mut second = entry(&mb, JournalCommand::Fetch, 1, 11);
        second.flags = Some(vec![Flag::Seen, Flag::Flagged]);
        mb.offer_entries(vec![first, second]);

        let plan = mb.flush_mini();
        assert_eq!(1, plan.fetch.len());
        assert_eq!(
            vec![Flag::Seen, Flag::Flagged],
            plan.fetch[0].flags,
        );
        assert_eq!(Modseq::of(11), plan.fetch[0].modseq);
    }

    #[test]
    fn own_expunge_stream_updates_mapping_as_it_goes() {
        let mut mb = selected(&[5, 6, 7]);
        assert_eq!(Some(Seqnum::u(2)), mb.expunge_own(Uid::u(6)));
        assert_eq!(Some(Seqnum::u(2)), mb.expunge_own(Uid::u(7)));
        assert_eq!(None, mb.expunge_own(Uid::u(6)));
        assert_eq!(vec![Uid::u(5)], mb.snapshot().to_vec());
    }

    proptest! {
        /// Property: emitted EXPUNGE sequence numbers, interpreted against
        /// the pre-expunge mapping, are strictly decreasing, and the
        /// survivors keep a consistent mapping.
        #[test]
        fn expunge_emission_order(
            present in prop::collection::btree_set(1u32..100, 1..30),
            doomed in prop::collection::btree_set(1u32..100, 1..30),
        ) {
            let present: Vec<u32> = present.into_iter().collect();
            let mut mb = selected(&present);
            let entries: Vec<JournalEntry> = doomed
                .iter()
                .enumerate()
                .map(|(i, &uid)| entry(
                    &mb,
                    JournalCommand::Expunge,
                    uid,
                    100 + i as u64,
                ))
                .collect();
            mb.offer_entries(entries);

            let plan = mb.flush_full();

            let emitted_seqnums: Vec<u32> = plan
                .expunge
                .iter()
                .map(|&(s, _)| s.0.get())
                .collect();
            let mut sorted = emitted_seqnums.clone();
            sorted.sort_unstable_by(|a, b| b.cmp(a));
            prop_assert_eq!(&sorted, &emitted_seqnums);

            let expected_survivors: Vec<Uid> = present
                .iter()
                .copied()
                .filter(|u| !doomed.contains(u))
                .map(Uid::u)
                .collect();
            prop_assert_eq!(expected_survivors, mb.snapshot().to_vec());
        }
    }
}
