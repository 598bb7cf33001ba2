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

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use log::warn;
use mongodb::bson::{doc, oid::ObjectId};

use super::defs::*;
use super::mailboxes::normalize_path;
use crate::account::model::*;
use crate::imap::response_writer::ResponseWriter;
use crate::storage::{
    self, JournalCommand, JournalEntry, Message, MessageId,
    MessageMeta, MessageSource,
};
use crate::support::error::Error;

impl CommandProcessor {
    pub(super) async fn cmd_append(
        &mut self,
        mailbox: String,
        flags: Vec<Flag>,
        date: Option<DateTime<Utc>>,
        message: Vec<u8>,
    ) -> CmdResult {
        let user = self.fetch_user().await?;
        let path = normalize_path(&mailbox);

        let response = self
            .handler
            .append(
                &user,
                &path,
                flags,
                date,
                &message,
                MessageSource::Imap,
            )
            .await
            .map_err(|e| match e {
                // APPEND reports a missing destination as TRYCREATE.
                Error::NxMailbox => {
                    map_error(&self.log_prefix, Error::NxDestination)
                }
                e => map_error(&self.log_prefix, e),
            })?;

        Ok(Response {
            cond: Cond::Ok,
            code: Some(RespCode::AppendUid {
                uid_validity: response.uid_validity,
                uid: response.uid,
            }),
            quip: Cow::Borrowed("Append completed"),
        })
    }

    pub(super) async fn cmd_copy(
        &mut self,
        messages: String,
        mailbox: String,
        uid_mode: bool,
        _w: &mut ResponseWriter,
    ) -> CmdResult {
        let principal = principal!(self)?.clone();
        let uids = self.resolve_message_set(&messages, uid_mode)?;
        let dest_path = normalize_path(&mailbox);

        let dest = self
            .storage
            .find_mailbox(principal.id, &dest_path)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?
            .ok_or_else(|| {
                map_error(&self.log_prefix, Error::NxDestination)
            })?;

        let selected = self.selected.as_ref().expect("checked above");
        let src_id = selected.id();

        let mut response = CopyResponse {
            uid_validity: dest.uid_validity,
            ..CopyResponse::default()
        };
        let mut entries = Vec::new();
        let mut copied_size = 0u64;
        let mut keywords: Vec<Flag> = Vec::new();

        let mut cursor = self
            .storage
            .find_messages(
                storage::mailbox_uid_filter(src_id, &uids),
                false,
            )
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;

        // One UID at a time: allocation must stay monotone even with
        // concurrent writers appending to the destination.
        while let Some(message) = cursor
            .try_next()
            .await
            .map_err(|e| map_error(&self.log_prefix, e.into()))?
        {
            let new_uid = self
                .storage
                .find_and_increment_uid_next(dest.id, 1)
                .await
                .map_err(|e| map_error(&self.log_prefix, e))?;
            let modseq = self
                .storage
                .next_modseq(dest.id)
                .await
                .map_err(|e| map_error(&self.log_prefix, e))?;

            let copy = Message {
                id: MessageId(ObjectId::new()),
                mailbox: dest.id,
                uid: new_uid,
                modseq,
                meta: MessageMeta {
                    source: MessageSource::ImapCopy,
                    time: Utc::now(),
                },
                ..message.clone()
            };
            self.storage
                .insert_message(&copy)
                .await
                .map_err(|e| map_error(&self.log_prefix, e))?;

            let mut hashes = copy.attachments.clone();
            hashes.push(copy.body.clone());
            self.storage
                .link_blobs(&hashes, copy.id)
                .await
                .map_err(|e| map_error(&self.log_prefix, e))?;

            let mut entry = JournalEntry::new(
                dest.id,
                JournalCommand::Exists,
                new_uid,
                modseq,
            );
            entry.message = Some(copy.id);
            entry.unseen = Some(!copy.seen);
            entries.push(entry);

            copied_size += copy.size as u64;
            for flag in &copy.flags {
                if flag.is_keyword() && !keywords.contains(flag) {
                    keywords.push(flag.clone());
                }
            }

            response.from_uids.append(message.uid);
            response.to_uids.append(new_uid);
        }

        if response.from_uids.is_empty() {
            return Ok(ok("No messages copied"));
        }

        self.storage
            .adjust_storage_used(principal.id, copied_size as i64)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;
        self.storage
            .learn_mailbox_flags(dest.id, &keywords)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;

        self.notifier
            .add_entries(&entries)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;
        self.notifier.fire(principal.id, &dest_path);

        Ok(Response {
            cond: Cond::Ok,
            code: Some(RespCode::CopyUid {
                uid_validity: response.uid_validity,
                from: response.from_uids.to_string(),
                to: response.to_uids.to_string(),
            }),
            quip: Cow::Borrowed("Copy completed"),
        })
    }

    pub(super) async fn cmd_move(
        &mut self,
        messages: String,
        mailbox: String,
        uid_mode: bool,
        w: &mut ResponseWriter,
    ) -> CmdResult {
        let principal = principal!(self)?.clone();
        let uids = self.resolve_message_set(&messages, uid_mode)?;
        let dest_path = normalize_path(&mailbox);

        {
            let selected = selected!(self)?;
            selected
                .require_writable()
                .map_err(|e| map_error(&self.log_prefix, e))?;
            if selected.path() == dest_path {
                return Err(bad("Source and destination are the same"));
            }
        }

        let user = self.fetch_user().await?;
        let src_path =
            self.selected.as_ref().expect("checked above").path()
                .to_owned();

        let response = self
            .handler
            .mv(&user, &src_path, &dest_path, self.session_id, &uids)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;

        if response.from_uids.is_empty() {
            return Ok(ok("No messages moved"));
        }

        // RFC 6851: the COPYUID arrives as an untagged OK, followed by
        // the source expunges.
        w.write_line(&format!(
            "* OK [COPYUID {} {} {}] Moved",
            response.uid_validity,
            response.from_uids,
            response.to_uids,
        ))
        .await
        .map_err(|_| bad("I/O error"))?;

        self.emit_own_expunges(
            response.from_uids.items(u32::MAX).collect(),
            w,
        )
        .await?;

        success()
    }

    pub(super) async fn cmd_expunge(
        &mut self,
        uid_set: Option<String>,
        w: &mut ResponseWriter,
    ) -> CmdResult {
        let uid_set = match uid_set {
            Some(raw) => Some(self.parse_uid_range(&raw)?),
            None => None,
        };
        self.expunge_impl(uid_set, Some(w)).await?;
        success()
    }

    pub(super) async fn cmd_close(
        &mut self,
        _w: &mut ResponseWriter,
    ) -> CmdResult {
        let writable = {
            let selected = selected!(self)?;
            !selected.read_only()
        };

        // CLOSE expunges silently: no untagged responses are sent for
        // the messages it removes.
        if writable {
            self.expunge_impl(None, None).await?;
        }

        self.deselect();
        success()
    }

    pub(super) fn cmd_unselect(&mut self) -> CmdResult {
        selected!(self)?;
        self.deselect();
        success()
    }

    /// The shared EXPUNGE path. `w` is `None` for CLOSE's silent form.
    async fn expunge_impl(
        &mut self,
        uid_set: Option<SeqRange<Uid>>,
        w: Option<&mut ResponseWriter>,
    ) -> Result<(), Response> {
        let (src_id, user, path) = {
            let selected = selected!(self)?;
            selected
                .require_writable()
                .map_err(|e| map_error(&self.log_prefix, e))?;
            (
                selected.id(),
                selected.user(),
                selected.path().to_owned(),
            )
        };

        let mut filter = match uid_set {
            Some(ref uids) => storage::mailbox_uid_filter(src_id, uids),
            None => doc! { "mailbox": src_id.0 },
        };
        filter.insert("deleted", true);

        let mut cursor = self
            .storage
            .find_messages(filter, true)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;

        let mut entries = Vec::new();
        let mut deleted_storage = 0u64;
        let mut doomed_uids = Vec::new();
        let mut blob_hashes = Vec::new();

        while let Some(message) = cursor
            .try_next()
            .await
            .map_err(|e| map_error(&self.log_prefix, e.into()))?
        {
            let modseq = self
                .storage
                .next_modseq(src_id)
                .await
                .map_err(|e| map_error(&self.log_prefix, e))?;

            self.storage
                .delete_message(message.id)
                .await
                .map_err(|e| map_error(&self.log_prefix, e))?;
            deleted_storage += message.size as u64;

            let mut hashes = message.attachments.clone();
            hashes.push(message.body.clone());
            if let Err(e) = self
                .storage
                .unlink_blobs(&hashes, message.id)
                .await
            {
                warn!(
                    "{} Blob unlink during EXPUNGE failed: {}",
                    self.log_prefix, e,
                );
            }
            blob_hashes.extend(hashes);

            let mut entry = JournalEntry::new(
                src_id,
                JournalCommand::Expunge,
                message.uid,
                modseq,
            );
            entry.message = Some(message.id);
            entry.ignore = Some(self.session_id);
            entries.push(entry);

            doomed_uids.push(message.uid);
        }

        if let Some(w) = w {
            self.emit_own_expunges(doomed_uids, w).await?;
        } else {
            // Silent (CLOSE): still remove from the snapshot so a later
            // drain can't resolve these UIDs.
            for uid in doomed_uids {
                if let Some(selected) = self.selected.as_mut() {
                    selected.expunge_own(uid);
                }
            }
        }

        self.storage
            .adjust_storage_used(user, -(deleted_storage as i64))
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;

        self.notifier
            .add_entries(&entries)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;
        self.notifier.fire(user, &path);

        // Best-effort sweep of now-unreferenced blobs; a failure is
        // retried by whichever expunge next touches the same content.
        blob_hashes.sort_unstable();
        blob_hashes.dedup();
        for hash in blob_hashes {
            if let Err(e) = self.storage.sweep_blob(&hash).await {
                warn!(
                    "{} Blob sweep failed for {}: {}",
                    self.log_prefix, hash, e,
                );
            }
        }

        Ok(())
    }

    /// Emit this session's own EXPUNGE stream for `uids` (ascending),
    /// updating the snapshot as each line goes out.
    async fn emit_own_expunges(
        &mut self,
        uids: Vec<Uid>,
        w: &mut ResponseWriter,
    ) -> Result<(), Response> {
        if self.qresync_enabled {
            let mut vanished = SeqRange::new();
            for uid in uids {
                if let Some(selected) = self.selected.as_mut() {
                    if selected.expunge_own(uid).is_some() {
                        vanished.append(uid);
                    }
                }
            }
            if !vanished.is_empty() {
                w.write_line(&format!("* VANISHED {}", vanished))
                    .await
                    .map_err(|_| bad("I/O error"))?;
            }
        } else {
            for uid in uids {
                let Some(selected) = self.selected.as_mut() else {
                    break;
                };
                if let Some(seqnum) = selected.expunge_own(uid) {
                    w.write_line(&format!(
                        "* {} EXPUNGE",
                        seqnum.0.get(),
                    ))
                    .await
                    .map_err(|_| bad("I/O error"))?;
                }
            }
        }
        Ok(())
    }

    /// Resolve a client message set into UIDs against the snapshot.
    pub(super) fn resolve_message_set(
        &mut self,
        messages: &str,
        uid_mode: bool,
    ) -> Result<SeqRange<Uid>, Response> {
        if uid_mode {
            self.parse_uid_range(messages)
        } else {
            let seqnums = self.parse_seqnum_range(messages)?;
            let selected = selected!(self)?;
            selected
                .seqnum_range_to_uids(&seqnums)
                .map_err(|e| map_error(&self.log_prefix, e))
        }
    }
}
