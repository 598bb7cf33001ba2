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

//! Thin, typed façade over the document store.
//!
//! Every operation here either succeeds fully or reports a storage error;
//! there are no partial document writes. The interesting guarantees live
//! on two methods: `find_and_increment_uid_next` and `next_modseq`, which
//! are the only writers of their counters and are single-document atomic
//! read-modify-writes, so concurrent writers observe a strict
//! serialization per mailbox.

mod attachments;
mod journal;
mod mailboxes;
mod messages;
mod types;
mod users;

pub use self::attachments::content_hash;
pub use self::messages::{mailbox_uid_filter, uid_set_filter, FlagWrite};
pub use self::types::*;

use mongodb::bson::doc;
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, IndexModel};

use crate::support::error::Error;
use crate::support::system_config::DatabaseConfig;

/// The collection names, contractual for this deployment.
const USERS: &str = "users";
const MAILBOXES: &str = "mailboxes";
const MESSAGES: &str = "messages";
const JOURNAL: &str = "journal";
const ATTACHMENT_FILES: &str = "attachments.files";

pub struct Storage {
    client: Client,
    db_name: String,
    users: Collection<User>,
    mailboxes: Collection<Mailbox>,
    messages: Collection<Message>,
    journal: Collection<JournalEntry>,
    attachments: Collection<AttachmentFile>,
}

impl Storage {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, Error> {
        let client = Client::with_uri_str(&config.uri).await?;
        let db = client.database(&config.name);
        Ok(Self {
            users: db.collection(USERS),
            mailboxes: db.collection(MAILBOXES),
            messages: db.collection(MESSAGES),
            journal: db.collection(JOURNAL),
            attachments: db.collection(ATTACHMENT_FILES),
            db_name: config.name.clone(),
            client,
        })
    }

    fn client(&self) -> &Client {
        &self.client
    }

    fn messages_namespace(&self) -> mongodb::Namespace {
        mongodb::Namespace {
            db: self.db_name.clone(),
            coll: MESSAGES.to_owned(),
        }
    }

    /// Create or verify every index the gateway's queries rely on.
    ///
    /// Called once at startup, before the listener binds. Index creation is
    /// idempotent; an existing index with the same specification is left
    /// alone.
    pub async fn ensure_indexes(&self) -> Result<(), Error> {
        fn unique(keys: mongodb::bson::Document) -> IndexModel {
            IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().unique(true).build())
                .build()
        }

        fn plain(keys: mongodb::bson::Document) -> IndexModel {
            IndexModel::builder().keys(keys).build()
        }

        self.users
            .create_index(unique(doc! { "username": 1 }))
            .await?;

        self.mailboxes
            .create_indexes(vec![
                unique(doc! { "user": 1, "path": 1 }),
                plain(doc! { "user": 1, "subscribed": 1 }),
            ])
            .await?;

        self.messages
            .create_indexes(vec![
                unique(doc! { "mailbox": 1, "uid": 1 }),
                plain(doc! { "mailbox": 1, "modseq": 1 }),
                plain(doc! { "mailbox": 1, "deleted": 1 }),
                plain(doc! { "mailbox": 1, "seen": 1 }),
                plain(doc! { "text": "text" }),
            ])
            .await?;

        self.journal
            .create_index(plain(doc! { "mailbox": 1, "modseq": 1 }))
            .await?;

        Ok(())
    }
}
