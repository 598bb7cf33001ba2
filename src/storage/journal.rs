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

use futures::TryStreamExt;
use mongodb::bson::doc;

use super::{JournalEntry, MailboxId, Storage};
use crate::account::model::Modseq;
use crate::support::error::Error;

impl Storage {
    /// Persist a batch of journal entries in one unordered write.
    ///
    /// Entries for a mutation are appended before the mutating command's
    /// tagged OK is sent, so any session that fires-and-drains afterwards
    /// observes them.
    pub async fn append_journal(
        &self,
        entries: &[JournalEntry],
    ) -> Result<(), Error> {
        if entries.is_empty() {
            return Ok(());
        }

        self.journal.insert_many(entries).ordered(false).await?;
        Ok(())
    }

    /// Load all entries for the mailbox with a modseq strictly greater
    /// than `after`, in modseq order.
    pub async fn journal_since(
        &self,
        mailbox: MailboxId,
        after: Modseq,
    ) -> Result<Vec<JournalEntry>, Error> {
        Ok(self
            .journal
            .find(doc! {
                "mailbox": mailbox.0,
                "modseq": { "$gt": after.raw() as i64 },
            })
            .sort(doc! { "modseq": 1 })
            .await?
            .try_collect()
            .await?)
    }

    /// Drop entries for the mailbox at or below `up_to`.
    ///
    /// Safe only when every live session on the mailbox has already
    /// drained past `up_to`; the notifier computes that watermark.
    pub async fn trim_journal(
        &self,
        mailbox: MailboxId,
        up_to: Modseq,
    ) -> Result<u64, Error> {
        let deleted = self
            .journal
            .delete_many(doc! {
                "mailbox": mailbox.0,
                "modseq": { "$lte": up_to.raw() as i64 },
            })
            .await?;
        Ok(deleted.deleted_count)
    }

    /// Drop all journal entries for a mailbox that is being deleted.
    pub async fn delete_journal(
        &self,
        mailbox: MailboxId,
    ) -> Result<(), Error> {
        self.journal
            .delete_many(doc! { "mailbox": mailbox.0 })
            .await?;
        Ok(())
    }
}
