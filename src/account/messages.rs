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

//! Message insertion and relocation.
//!
//! `append` is the single entry point for new messages (IMAP APPEND and
//! any future ingestion path); `mv` is the storage half of MOVE. Both
//! allocate their UIDs one at a time through the mailbox document's atomic
//! counter so that UID order stays monotone even under concurrent writers,
//! and both make their journal entries durable before returning, which is
//! what lets the dispatcher promise that the tagged OK happens-after the
//! notifications became observable.

use std::sync::Arc;

use chrono::prelude::*;
use futures::TryStreamExt;
use mongodb::bson::oid::ObjectId;

use crate::account::model::{
    AppendResponse, CopyResponse, DenormalizedFlags, Flag, SeqRange, Uid,
};
use crate::account::notify::Notifier;
use crate::mime;
use crate::storage::{
    self, JournalCommand, JournalEntry, Message, MessageId, MessageMeta,
    MessageSource, SessionId, Storage, User,
};
use crate::support::error::Error;

pub struct MessageHandler {
    storage: Arc<Storage>,
    notifier: Arc<Notifier>,
    /// Fallback quota for users with none of their own; 0 = unlimited.
    max_storage: u64,
    /// Upper bound on a single message.
    max_message: u32,
}

impl MessageHandler {
    pub fn new(
        storage: Arc<Storage>,
        notifier: Arc<Notifier>,
        max_storage: u64,
        max_message: u32,
    ) -> Self {
        Self {
            storage,
            notifier,
            max_storage,
            max_message,
        }
    }

    fn effective_quota(&self, user: &User) -> u64 {
        if user.quota > 0 {
            user.quota
        } else {
            self.max_storage
        }
    }

    /// Insert a new message into `(user, path)`.
    ///
    /// Returns the allocated UID and the mailbox's UID validity for the
    /// `APPENDUID` response code.
    pub async fn append(
        &self,
        user: &User,
        path: &str,
        flags: Vec<Flag>,
        internal_date: Option<DateTime<Utc>>,
        raw: &[u8],
        source: MessageSource,
    ) -> Result<AppendResponse, Error> {
        if raw.len() > self.max_message as usize {
            return Err(Error::MessageTooLarge);
        }

        let mailbox = self
            .storage
            .find_mailbox(user.id, path)
            .await?
            .ok_or(Error::NxMailbox)?;

        let size = raw.len() as u32;
        let quota = self.effective_quota(user);
        if quota > 0 && user.storage_used_clamped() + size as u64 > quota {
            return Err(Error::OverQuota);
        }

        let uid = self
            .storage
            .find_and_increment_uid_next(mailbox.id, 1)
            .await?;

        let idate = internal_date.unwrap_or_else(Utc::now);
        let digest = mime::digest(raw, idate);

        let id = MessageId(ObjectId::new());
        let body = self.storage.put_blob(raw, id).await?;
        let mut attachments = Vec::with_capacity(digest.attachments.len());
        for payload in &digest.attachments {
            attachments.push(self.storage.put_blob(payload, id).await?);
        }

        let modseq = self.storage.next_modseq(mailbox.id).await?;
        let denorm = DenormalizedFlags::of(&flags);

        let message = Message {
            id,
            mailbox: mailbox.id,
            uid,
            modseq,
            idate,
            hdate: digest.hdate,
            seen: denorm.seen,
            flagged: denorm.flagged,
            deleted: denorm.deleted,
            flags,
            size,
            envelope: digest.envelope,
            bodystructure: digest.bodystructure,
            headers: digest.headers,
            body,
            attachments,
            text: digest.text,
            meta: MessageMeta {
                source,
                time: Utc::now(),
            },
        };
        self.storage.insert_message(&message).await?;
        self.storage.learn_mailbox_flags(mailbox.id, &message.flags).await?;

        self.storage
            .adjust_storage_used(user.id, size as i64)
            .await?;

        let mut entry =
            JournalEntry::new(mailbox.id, JournalCommand::Exists, uid, modseq);
        entry.message = Some(id);
        entry.unseen = Some(!denorm.seen);
        self.notifier.add_entries(std::slice::from_ref(&entry)).await?;
        self.notifier.fire(user.id, path);

        Ok(AppendResponse {
            uid_validity: mailbox.uid_validity,
            uid,
        })
    }

    /// Relocate the messages in `uids` from `src_path` to `dest_path`.
    ///
    /// Message documents are rewritten in place (stable message id, fresh
    /// mailbox/UID/modseq); quota is unaffected. The source EXPUNGE
    /// entries carry `ignore` for the moving session, which emits its own
    /// EXPUNGE stream as part of the MOVE response.
    pub async fn mv(
        &self,
        user: &User,
        src_path: &str,
        dest_path: &str,
        session: SessionId,
        uids: &SeqRange<Uid>,
    ) -> Result<CopyResponse, Error> {
        let src = self
            .storage
            .find_mailbox(user.id, src_path)
            .await?
            .ok_or(Error::NxMailbox)?;
        let dest = self
            .storage
            .find_mailbox(user.id, dest_path)
            .await?
            .ok_or(Error::NxDestination)?;

        let mut response = CopyResponse {
            uid_validity: dest.uid_validity,
            ..CopyResponse::default()
        };

        let mut src_entries = Vec::new();
        let mut dest_entries = Vec::new();

        let mut cursor = self
            .storage
            .find_messages(
                storage::mailbox_uid_filter(src.id, uids),
                true,
            )
            .await?;

        while let Some(message) = cursor.try_next().await? {
            let dest_uid = self
                .storage
                .find_and_increment_uid_next(dest.id, 1)
                .await?;
            let dest_modseq = self.storage.next_modseq(dest.id).await?;
            self.storage
                .rehome_message(message.id, dest.id, dest_uid, dest_modseq)
                .await?;
            self.storage
                .learn_mailbox_flags(dest.id, &message.flags)
                .await?;

            let src_modseq = self.storage.next_modseq(src.id).await?;
            let mut expunge = JournalEntry::new(
                src.id,
                JournalCommand::Expunge,
                message.uid,
                src_modseq,
            );
            expunge.message = Some(message.id);
            expunge.ignore = Some(session);
            src_entries.push(expunge);

            let mut exists = JournalEntry::new(
                dest.id,
                JournalCommand::Exists,
                dest_uid,
                dest_modseq,
            );
            exists.message = Some(message.id);
            exists.unseen = Some(!message.seen);
            dest_entries.push(exists);

            response.from_uids.append(message.uid);
            response.to_uids.append(dest_uid);
        }

        // Both sides' entries become observable before the caller can send
        // its tagged OK.
        self.notifier.add_entries(&src_entries).await?;
        self.notifier.add_entries(&dest_entries).await?;
        self.notifier.fire(user.id, src_path);
        self.notifier.fire(user.id, dest_path);

        Ok(response)
    }
}
