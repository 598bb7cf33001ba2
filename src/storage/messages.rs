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
use mongodb::bson::{doc, to_bson, Bson, Document};
use mongodb::options::{UpdateOneModel, WriteModel};
use mongodb::Cursor;
use serde::Deserialize;

use super::{MailboxId, Message, MessageId, Storage};
use crate::account::model::{
    DenormalizedFlags, Flag, Modseq, SeqRange, Uid,
};
use crate::support::error::Error;

/// Translate a UID sequence set into a filter on the `uid` field.
///
/// Ranges stay ranges instead of being enumerated so that `1:*` does not
/// materialize four billion array elements.
pub fn uid_set_filter(uids: &SeqRange<Uid>) -> Bson {
    let mut ranges: Vec<Document> = Vec::new();
    let mut scalars: Vec<i64> = Vec::new();
    for (start, end) in uids.ranges() {
        if start == end {
            scalars.push(start as i64);
        } else {
            ranges.push(doc! { "$gte": start as i64, "$lte": end as i64 });
        }
    }

    match (&*ranges, &*scalars) {
        // An empty set matches nothing; `$in` of nothing expresses that
        // without special-casing at the call sites.
        ([], []) => Bson::Document(doc! { "$in": Bson::Array(vec![]) }),
        ([], [only]) => Bson::Int64(*only),
        ([], _) => Bson::Document(doc! { "$in": scalars }),
        ([only], []) => Bson::Document(only.clone()),
        _ => {
            let mut ors: Vec<Document> =
                ranges.into_iter().map(|r| doc! { "uid": r }).collect();
            if !scalars.is_empty() {
                ors.push(doc! { "uid": { "$in": scalars } });
            }
            Bson::Document(doc! { "$or": ors })
        }
    }
}

/// Build the canonical `{mailbox, uid-set}` filter. The result is a full
/// filter document (not a `uid` field value) since range unions need
/// `$or`.
pub fn mailbox_uid_filter(
    mailbox: MailboxId,
    uids: &SeqRange<Uid>,
) -> Document {
    match uid_set_filter(uids) {
        Bson::Document(d) if d.contains_key("$or") => {
            let mut filter = doc! { "mailbox": mailbox.0 };
            filter.insert("$or", d.get_array("$or").unwrap().clone());
            filter
        }
        other => doc! { "mailbox": mailbox.0, "uid": other },
    }
}

/// One message's worth of a bulk flag write.
#[derive(Clone, Debug)]
pub struct FlagWrite {
    pub message: MessageId,
    pub flags: Vec<Flag>,
    pub modseq: Modseq,
}

#[derive(Deserialize)]
struct UidOnly {
    uid: Uid,
}

impl Storage {
    pub async fn insert_message(
        &self,
        message: &Message,
    ) -> Result<(), Error> {
        self.messages.insert_one(message).await?;
        Ok(())
    }

    pub async fn find_message(
        &self,
        mailbox: MailboxId,
        uid: Uid,
    ) -> Result<Option<Message>, Error> {
        Ok(self
            .messages
            .find_one(doc! { "mailbox": mailbox.0, "uid": u32::from(uid) as i64 })
            .await?)
    }

    /// Stream messages matching `filter` in ascending UID order.
    ///
    /// When `metadata_only`, the rendered search text is not projected;
    /// everything a flags/envelope-level fetch needs still is.
    pub async fn find_messages(
        &self,
        filter: Document,
        metadata_only: bool,
    ) -> Result<Cursor<Message>, Error> {
        let mut find = self.messages.find(filter).sort(doc! { "uid": 1 });
        if metadata_only {
            find = find.projection(doc! { "text": 0 });
        }
        Ok(find.await?)
    }

    /// All UIDs in the mailbox, ascending. This is the session snapshot
    /// loaded at SELECT.
    pub async fn uid_list(
        &self,
        mailbox: MailboxId,
    ) -> Result<Vec<Uid>, Error> {
        let cursor = self
            .messages
            .clone_with_type::<UidOnly>()
            .find(doc! { "mailbox": mailbox.0 })
            .projection(doc! { "uid": 1, "_id": 0 })
            .sort(doc! { "uid": 1 })
            .await?;
        Ok(cursor
            .try_collect::<Vec<UidOnly>>()
            .await?
            .into_iter()
            .map(|u| u.uid)
            .collect())
    }

    pub async fn count_messages(
        &self,
        filter: Document,
    ) -> Result<u64, Error> {
        Ok(self.messages.count_documents(filter).await?)
    }

    pub async fn first_unseen_uid(
        &self,
        mailbox: MailboxId,
    ) -> Result<Option<Uid>, Error> {
        Ok(self
            .messages
            .clone_with_type::<UidOnly>()
            .find_one(doc! { "mailbox": mailbox.0, "seen": false })
            .projection(doc! { "uid": 1, "_id": 0 })
            .sort(doc! { "uid": 1 })
            .await?
            .map(|u| u.uid))
    }

    /// Sum of `size` over every message in the mailbox.
    pub async fn aggregate_size(
        &self,
        mailbox: MailboxId,
    ) -> Result<u64, Error> {
        let mut cursor = self
            .messages
            .aggregate(vec![
                doc! { "$match": { "mailbox": mailbox.0 } },
                doc! { "$group": {
                    "_id": Bson::Null,
                    "total": { "$sum": "$size" },
                } },
            ])
            .await?;

        let Some(row) = cursor.try_next().await? else {
            return Ok(0);
        };
        Ok(row.get_i64("total").unwrap_or(0).max(0) as u64)
    }

    pub async fn delete_message(
        &self,
        id: MessageId,
    ) -> Result<(), Error> {
        self.messages.delete_one(doc! { "_id": id.0 }).await?;
        Ok(())
    }

    pub async fn delete_messages_in_mailbox(
        &self,
        mailbox: MailboxId,
    ) -> Result<(), Error> {
        self.messages
            .delete_many(doc! { "mailbox": mailbox.0 })
            .await?;
        Ok(())
    }

    /// Persist a batch of flag rewrites as one unordered bulk write.
    ///
    /// Unordered within the batch per the write-batching contract; a
    /// failure aborts the current command but leaves previously flushed
    /// batches in place.
    pub async fn bulk_update_flags(
        &self,
        writes: &[FlagWrite],
    ) -> Result<(), Error> {
        if writes.is_empty() {
            return Ok(());
        }

        let ns = self.messages_namespace();
        let mut models = Vec::with_capacity(writes.len());
        for write in writes {
            let denorm = DenormalizedFlags::of(&write.flags);
            models.push(WriteModel::UpdateOne(
                UpdateOneModel::builder()
                    .namespace(ns.clone())
                    .filter(doc! { "_id": write.message.0 })
                    .update(doc! { "$set": {
                        "flags": to_bson(&write.flags)?,
                        "seen": denorm.seen,
                        "flagged": denorm.flagged,
                        "deleted": denorm.deleted,
                        "modseq": write.modseq.raw() as i64,
                    } })
                    .build(),
            ));
        }

        self.client().bulk_write(models).ordered(false).await?;
        Ok(())
    }

    /// Rewrite a message document to live in another mailbox under a fresh
    /// UID, as the MOVE operation requires. The message id is stable
    /// across the move.
    pub async fn rehome_message(
        &self,
        id: MessageId,
        dest: MailboxId,
        uid: Uid,
        modseq: Modseq,
    ) -> Result<(), Error> {
        self.messages
            .update_one(
                doc! { "_id": id.0 },
                doc! { "$set": {
                    "mailbox": dest.0,
                    "uid": u32::from(uid) as i64,
                    "modseq": modseq.raw() as i64,
                    "meta.source": "IMAPMOVE",
                } },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_range_uses_plain_operator() {
        let filter = mailbox_uid_filter(
            MailboxId(mongodb::bson::oid::ObjectId::new()),
            &SeqRange::range(Uid::u(5), Uid::u(9)),
        );
        assert_eq!(
            Some(&Bson::Document(doc! { "$gte": 5i64, "$lte": 9i64 })),
            filter.get("uid"),
        );
    }

    #[test]
    fn single_uid_is_a_scalar_match() {
        let filter = mailbox_uid_filter(
            MailboxId(mongodb::bson::oid::ObjectId::new()),
            &SeqRange::just(Uid::u(7)),
        );
        assert_eq!(Some(&Bson::Int64(7)), filter.get("uid"));
    }

    #[test]
    fn disjoint_set_becomes_or_of_ranges_and_in() {
        let mut uids = SeqRange::new();
        uids.insert(Uid::u(1), Uid::u(3));
        uids.append(Uid::u(7));
        uids.insert(Uid::u(10), Uid::u(20));

        let filter = mailbox_uid_filter(
            MailboxId(mongodb::bson::oid::ObjectId::new()),
            &uids,
        );
        let ors = filter.get_array("$or").unwrap();
        assert_eq!(3, ors.len());
    }
}
