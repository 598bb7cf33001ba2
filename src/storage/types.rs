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

//! The document types stored in the database.
//!
//! Field names here are contractual: they are what lands in the
//! collections, what the index manifest refers to, and what the search
//! compiler emits queries against. Renaming one is a schema migration.

use chrono::prelude::*;
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::account::model::{Flag, Modseq, SpecialUse, Uid};
use crate::mime::{BodyStructure, Envelope, HeaderPair};

/// A stable identifier for a user principal.
#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(transparent)]
pub struct UserId(pub ObjectId);

/// A stable identifier for a mailbox.
#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(transparent)]
pub struct MailboxId(pub ObjectId);

/// A stable identifier for a message, distinct from its per-mailbox UID.
#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(transparent)]
pub struct MessageId(pub ObjectId);

/// A stable identifier for a journal entry, used for at-least-once
/// de-duplication at the session.
#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(transparent)]
pub struct JournalId(pub ObjectId);

/// Identifies one IMAP session within this process.
///
/// Stamped onto journal entries as `ignore` so a session never re-receives
/// its own changes. Only meaningful within the process that assigned it,
/// which is fine: a session's journal entries are only suppressed while
/// that session is alive to drain them.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
)]
#[serde(transparent)]
pub struct SessionId(pub u32);

/// A user principal, stored in `users`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id")]
    pub id: UserId,
    /// Unique login name.
    pub username: String,
    /// bcrypt hash of the password.
    pub password: String,
    /// Quota in bytes; 0 means unlimited (or rather, limited only by the
    /// server-wide `max_storage`).
    #[serde(default)]
    pub quota: u64,
    /// Bytes currently attributed to this user's messages. Adjusted by
    /// deltas as messages come and go; may transiently drift, so reads
    /// clamp at zero instead of trusting it blindly.
    #[serde(default)]
    pub storage_used: i64,
}

impl User {
    /// The accounted storage, clamped so accounting drift can never
    /// produce a negative value on the wire.
    pub fn storage_used_clamped(&self) -> u64 {
        self.storage_used.max(0) as u64
    }
}

/// A mailbox, stored in `mailboxes`. `(user, path)` is unique.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mailbox {
    #[serde(rename = "_id")]
    pub id: MailboxId,
    pub user: UserId,
    /// Case-sensitive, `/`-separated path.
    pub path: String,
    /// Assigned from wall-clock seconds at creation; never changes.
    pub uid_validity: u32,
    /// The next UID to assign. Strictly increasing; UIDs are never reused.
    /// Only `find_and_increment_uid_next` writes this field.
    pub uid_next: u32,
    /// The highest modseq ever assigned in this mailbox. Only
    /// `next_modseq` writes this field.
    pub modify_index: Modseq,
    pub subscribed: bool,
    /// Keywords ever seen in this mailbox, in first-seen order, capped at
    /// `MAX_LEARNED_FLAGS`.
    #[serde(default)]
    pub flags: Vec<Flag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_use: Option<SpecialUse>,
}

/// The cap on learned keywords per mailbox.
pub const MAX_LEARNED_FLAGS: usize = 100;

/// Where a message came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageSource {
    #[serde(rename = "IMAP")]
    Imap,
    #[serde(rename = "IMAPCOPY")]
    ImapCopy,
    #[serde(rename = "IMAPMOVE")]
    ImapMove,
    #[serde(rename = "SMTP")]
    Smtp,
}

/// Provenance metadata kept on every message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageMeta {
    pub source: MessageSource,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub time: DateTime<Utc>,
}

/// A message, stored in `messages`. `(mailbox, uid)` is unique and
/// `uid < mailbox.uid_next` always.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "_id")]
    pub id: MessageId,
    pub mailbox: MailboxId,
    pub uid: Uid,
    pub modseq: Modseq,
    /// IMAP INTERNALDATE.
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub idate: DateTime<Utc>,
    /// Parsed `Date:` header, falling back to `idate`.
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub hdate: DateTime<Utc>,
    pub flags: Vec<Flag>,
    /// Denormalized flag booleans; must equal membership in `flags` at all
    /// times. These back the narrow `(mailbox, seen)` / `(mailbox,
    /// deleted)` indexes.
    pub seen: bool,
    pub flagged: bool,
    pub deleted: bool,
    /// Octet count of the raw RFC 5322 message.
    pub size: u32,
    pub envelope: Envelope,
    pub bodystructure: BodyStructure,
    pub headers: Vec<HeaderPair>,
    /// Content hash of the raw message blob; resolved lazily when a fetch
    /// actually needs body content.
    pub body: String,
    /// Content hashes of extracted attachment blobs.
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Decoded text rendered for the full-text index.
    #[serde(default)]
    pub text: String,
    pub meta: MessageMeta,
}

/// The change kinds recorded in the journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalCommand {
    #[serde(rename = "EXISTS")]
    Exists,
    #[serde(rename = "EXPUNGE")]
    Expunge,
    #[serde(rename = "FETCH")]
    Fetch,
}

/// An append-only change record scoped to a mailbox, stored in `journal`.
///
/// The journal is authoritative for "what has changed since modseq X"
/// queries; selected sessions drain it to produce their untagged
/// responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    #[serde(rename = "_id")]
    pub id: JournalId,
    pub mailbox: MailboxId,
    pub command: JournalCommand,
    pub uid: Uid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<Flag>>,
    /// For `Exists` entries, whether the new message lacked `\Seen` at
    /// insertion, so sessions can report it for `UNSEEN` recomputation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unseen: Option<bool>,
    /// The session that produced this change and must not receive it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore: Option<SessionId>,
    pub modseq: Modseq,
    #[serde(with = "bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created: DateTime<Utc>,
}

impl JournalEntry {
    pub fn new(
        mailbox: MailboxId,
        command: JournalCommand,
        uid: Uid,
        modseq: Modseq,
    ) -> Self {
        Self {
            id: JournalId(ObjectId::new()),
            mailbox,
            command,
            uid,
            message: None,
            flags: None,
            unseen: None,
            ignore: None,
            modseq,
            created: Utc::now(),
        }
    }
}

/// Metadata on a content-addressed blob, stored in `attachments.files`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttachmentFile {
    /// SHA-256 of the content, hex-encoded. Content addressing makes
    /// storage of a blob idempotent.
    #[serde(rename = "_id")]
    pub id: String,
    pub length: u32,
    pub data: bson::Binary,
    pub metadata: AttachmentMetadata,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttachmentMetadata {
    /// Multiset of referencing message ids: one element per reference, so
    /// a message embedding the same content twice appears twice. A blob
    /// whose multiset is empty is eligible for deletion.
    pub messages: Vec<MessageId>,
}
