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

use futures::TryStreamExt;

use super::defs::*;
use crate::account::model::*;
use crate::imap::response_writer::ResponseWriter;
use crate::imap::syntax::{self as s, StoreCommand};
use crate::storage::{
    self, FlagWrite, JournalCommand, JournalEntry,
};

impl CommandProcessor {
    pub(super) async fn cmd_store(
        &mut self,
        cmd: StoreCommand,
        uid_mode: bool,
        w: &mut ResponseWriter,
    ) -> CmdResult {
        // UNCHANGEDSINCE is a CONDSTORE enabling action (RFC 7162).
        if cmd.unchanged_since.is_some() {
            self.condstore_enabled = true;
        }

        let uids = self.resolve_message_set(&cmd.messages, uid_mode)?;
        let (mailbox_id, user, path) = {
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

        let mut cursor = self
            .storage
            .find_messages(
                storage::mailbox_uid_filter(mailbox_id, &uids),
                true,
            )
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;

        let mut writes: Vec<FlagWrite> = Vec::new();
        let mut entries: Vec<JournalEntry> = Vec::new();
        let mut modified: SeqRange<Uid> = SeqRange::new();

        while let Some(message) = cursor
            .try_next()
            .await
            .map_err(|e| map_error(&self.log_prefix, e.into()))?
        {
            // CONDSTORE: rows that moved past the client's reference
            // point are reported, not touched. (UNCHANGEDSINCE 0 is
            // required to fail for every message; it does, since every
            // live modseq is at least 1.)
            if let Some(unchanged_since) = cmd.unchanged_since {
                if message.modseq.raw() > unchanged_since {
                    modified.append(message.uid);
                    continue;
                }
            }

            let (new_flags, changed) = apply_store_action(
                &message.flags,
                &cmd.flags,
                cmd.action,
            );
            if !changed {
                continue;
            }

            let modseq = self
                .storage
                .next_modseq(mailbox_id)
                .await
                .map_err(|e| map_error(&self.log_prefix, e))?;

            writes.push(FlagWrite {
                message: message.id,
                flags: new_flags.clone(),
                modseq,
            });

            let mut entry = JournalEntry::new(
                mailbox_id,
                JournalCommand::Fetch,
                message.uid,
                modseq,
            );
            entry.message = Some(message.id);
            entry.flags = Some(new_flags.clone());
            entry.ignore = Some(self.session_id);
            entries.push(entry);

            if !cmd.silent {
                let seqnum = self
                    .selected
                    .as_ref()
                    .and_then(|sel| sel.seqnum_of(message.uid));
                if let Some(seqnum) = seqnum {
                    let mut attrs = String::new();
                    if uid_mode {
                        attrs.push_str(&format!(
                            "UID {} ",
                            u32::from(message.uid),
                        ));
                    }
                    attrs.push_str(&format!(
                        "FLAGS {}",
                        s::flag_list(&new_flags),
                    ));
                    if self.condstore_enabled
                        || cmd.unchanged_since.is_some()
                    {
                        attrs.push_str(&format!(
                            " MODSEQ ({})",
                            modseq.wire_value(),
                        ));
                    }
                    w.write_line(&format!(
                        "* {} FETCH ({})",
                        seqnum.0.get(),
                        attrs,
                    ))
                    .await
                    .map_err(|_| bad("I/O error"))?;
                }
            }

            if writes.len() >= BULK_BATCH {
                self.flush_flag_batch(&mut writes, &mut entries, user, &path)
                    .await?;
            }
        }

        self.flush_flag_batch(&mut writes, &mut entries, user, &path)
            .await?;

        // Mailbox-flag learning: newly seen keywords join the mailbox's
        // set. A removal can never grow it.
        if StoreAction::Remove != cmd.action {
            self.storage
                .learn_mailbox_flags(mailbox_id, &cmd.flags)
                .await
                .map_err(|e| map_error(&self.log_prefix, e))?;
        }

        if cmd.unchanged_since.is_some() && !modified.is_empty() {
            let rendered = if uid_mode {
                modified.to_string()
            } else {
                let selected = selected!(self)?;
                selected.uid_range_to_seqnums(&modified).to_string()
            };
            return Ok(Response {
                cond: Cond::Ok,
                code: Some(RespCode::Modified(rendered)),
                quip: Cow::Borrowed("Conditional store partially failed"),
            });
        }

        success()
    }

    /// Persist one batch of flag writes and make its journal entries
    /// observable, then wake the other sessions.
    async fn flush_flag_batch(
        &mut self,
        writes: &mut Vec<FlagWrite>,
        entries: &mut Vec<JournalEntry>,
        user: crate::storage::UserId,
        path: &str,
    ) -> Result<(), Response> {
        if writes.is_empty() {
            return Ok(());
        }

        self.storage
            .bulk_update_flags(writes)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;
        self.notifier
            .add_entries(entries)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;
        self.notifier.fire(user, path);

        writes.clear();
        entries.clear();
        Ok(())
    }
}
