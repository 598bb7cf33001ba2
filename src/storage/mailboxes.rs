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
use mongodb::bson::{doc, to_bson};
use mongodb::options::ReturnDocument;

use super::{Mailbox, MailboxId, Storage, UserId, MAX_LEARNED_FLAGS};
use crate::account::model::{Flag, Modseq, Uid};
use crate::support::error::Error;

impl Storage {
    pub async fn find_mailbox(
        &self,
        user: UserId,
        path: &str,
    ) -> Result<Option<Mailbox>, Error> {
        Ok(self
            .mailboxes
            .find_one(doc! { "user": user.0, "path": path })
            .await?)
    }

    pub async fn find_mailbox_by_id(
        &self,
        id: MailboxId,
    ) -> Result<Option<Mailbox>, Error> {
        Ok(self.mailboxes.find_one(doc! { "_id": id.0 }).await?)
    }

    /// List the user's mailboxes, sorted by path.
    pub async fn list_mailboxes(
        &self,
        user: UserId,
        subscribed_only: bool,
    ) -> Result<Vec<Mailbox>, Error> {
        let mut filter = doc! { "user": user.0 };
        if subscribed_only {
            filter.insert("subscribed", true);
        }

        Ok(self
            .mailboxes
            .find(filter)
            .sort(doc! { "path": 1 })
            .await?
            .try_collect()
            .await?)
    }

    /// List the mailboxes whose path starts with `path/`, sorted by path.
    pub async fn list_descendants(
        &self,
        user: UserId,
        path: &str,
    ) -> Result<Vec<Mailbox>, Error> {
        let prefix = format!("{}/", path);
        let pattern = format!("^{}", regex::escape(&prefix));
        Ok(self
            .mailboxes
            .find(doc! {
                "user": user.0,
                "path": { "$regex": pattern },
            })
            .sort(doc! { "path": 1 })
            .await?
            .try_collect()
            .await?)
    }

    pub async fn insert_mailbox(
        &self,
        mailbox: &Mailbox,
    ) -> Result<(), Error> {
        self.mailboxes.insert_one(mailbox).await?;
        Ok(())
    }

    pub async fn set_mailbox_path(
        &self,
        id: MailboxId,
        path: &str,
    ) -> Result<(), Error> {
        self.mailboxes
            .update_one(
                doc! { "_id": id.0 },
                doc! { "$set": { "path": path } },
            )
            .await?;
        Ok(())
    }

    pub async fn set_mailbox_subscribed(
        &self,
        id: MailboxId,
        subscribed: bool,
    ) -> Result<(), Error> {
        self.mailboxes
            .update_one(
                doc! { "_id": id.0 },
                doc! { "$set": { "subscribed": subscribed } },
            )
            .await?;
        Ok(())
    }

    pub async fn delete_mailbox(&self, id: MailboxId) -> Result<(), Error> {
        self.mailboxes.delete_one(doc! { "_id": id.0 }).await?;
        Ok(())
    }

    /// Atomically allocate `n` UIDs from the mailbox, returning the first
    /// one.
    ///
    /// This is the UID allocator: a single-document find-and-modify, so
    /// two sessions appending concurrently always observe disjoint,
    /// strictly increasing UIDs.
    pub async fn find_and_increment_uid_next(
        &self,
        id: MailboxId,
        n: u32,
    ) -> Result<Uid, Error> {
        let before = self
            .mailboxes
            .find_one_and_update(
                doc! { "_id": id.0 },
                doc! { "$inc": { "uid_next": n as i64 } },
            )
            .return_document(ReturnDocument::Before)
            .await?
            .ok_or(Error::NxMailbox)?;

        if u32::MAX - n < before.uid_next {
            return Err(Error::UidSpaceExhausted);
        }

        Uid::of(before.uid_next).ok_or(Error::UidSpaceExhausted)
    }

    /// Atomically allocate the next modseq for the mailbox.
    ///
    /// Like the UID allocator, this is the only writer of `modify_index`.
    pub async fn next_modseq(&self, id: MailboxId) -> Result<Modseq, Error> {
        let after = self
            .mailboxes
            .find_one_and_update(
                doc! { "_id": id.0 },
                doc! { "$inc": { "modify_index": 1i64 } },
            )
            .return_document(ReturnDocument::After)
            .await?
            .ok_or(Error::NxMailbox)?;

        Ok(after.modify_index)
    }

    /// Add any keyword in `flags` that the mailbox has not seen before,
    /// preserving first-seen order and never exceeding the cap.
    ///
    /// The `$addToSet` keeps the union atomic with respect to concurrent
    /// learners; the cap check tolerates racing slightly past the limit in
    /// exchange for not serializing all stores on the mailbox document.
    pub async fn learn_mailbox_flags(
        &self,
        id: MailboxId,
        flags: &[Flag],
    ) -> Result<(), Error> {
        let keywords: Vec<&Flag> =
            flags.iter().filter(|f| f.is_keyword()).collect();
        if keywords.is_empty() {
            return Ok(());
        }

        let Some(mailbox) = self.find_mailbox_by_id(id).await? else {
            return Err(Error::NxMailbox);
        };

        let room =
            MAX_LEARNED_FLAGS.saturating_sub(mailbox.flags.len());
        let new: Vec<_> = keywords
            .into_iter()
            .filter(|f| !mailbox.flags.contains(*f))
            .take(room)
            .collect();
        if new.is_empty() {
            return Ok(());
        }

        self.mailboxes
            .update_one(
                doc! { "_id": id.0 },
                doc! { "$addToSet": {
                    "flags": { "$each": to_bson(&new)? },
                } },
            )
            .await?;
        Ok(())
    }
}
