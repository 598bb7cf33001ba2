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

use chrono::Utc;
use futures::TryStreamExt;
use log::warn;
use mongodb::bson::{doc, oid::ObjectId};
use regex::Regex;

use super::defs::*;
use crate::account::model::*;
use crate::account::selected::SelectedMailbox;
use crate::imap::response_writer::ResponseWriter;
use crate::imap::syntax as s;
use crate::storage::{Mailbox, MailboxId, User};
use crate::support::error::Error;

impl CommandProcessor {
    pub(super) async fn cmd_list(
        &mut self,
        reference: String,
        pattern: String,
        lsub: bool,
        w: &mut ResponseWriter,
    ) -> CmdResult {
        let principal = principal!(self)?.clone();

        // An empty pattern just asks for the hierarchy delimiter.
        if pattern.is_empty() {
            let verb = if lsub { "LSUB" } else { "LIST" };
            w.write_line(&format!(
                "* {} (\\Noselect) \"/\" \"\"",
                verb,
            ))
            .await
            .map_err(|_| bad("I/O error"))?;
            return success();
        }

        let mut full_pattern = reference;
        if !full_pattern.is_empty() && !full_pattern.ends_with('/') {
            full_pattern.push('/');
        }
        full_pattern.push_str(&pattern);

        let matcher = pattern_to_regex(&full_pattern)
            .map_err(|_| bad("Unparsable list pattern"))?;

        let mailboxes = self
            .storage
            .list_mailboxes(principal.id, lsub)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;

        let verb = if lsub { "LSUB" } else { "LIST" };
        for mailbox in &mailboxes {
            if !matcher.is_match(&mailbox.path) {
                continue;
            }

            let prefix = format!("{}/", mailbox.path);
            let has_children = mailboxes
                .iter()
                .any(|m| m.path.starts_with(&prefix));

            let mut attributes = Vec::new();
            if has_children {
                attributes.push(MailboxAttribute::HasChildren);
            } else {
                attributes.push(MailboxAttribute::HasNoChildren);
            }
            if let Some(role) = mailbox.special_use {
                attributes.push(role.into());
            }

            let attributes: Vec<&str> =
                attributes.iter().map(|a| a.name()).collect();
            w.write_line(&format!(
                "* {} ({}) \"/\" {}",
                verb,
                attributes.join(" "),
                s::astring(&mailbox.path),
            ))
            .await
            .map_err(|_| bad("I/O error"))?;
        }

        success()
    }

    pub(super) async fn cmd_set_subscribed(
        &mut self,
        name: String,
        subscribed: bool,
    ) -> CmdResult {
        let principal = principal!(self)?.clone();
        let path = normalize_path(&name);

        let mailbox = self
            .storage
            .find_mailbox(principal.id, &path)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?
            .ok_or_else(|| {
                map_error(&self.log_prefix, Error::NxMailbox)
            })?;

        self.storage
            .set_mailbox_subscribed(mailbox.id, subscribed)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;
        success()
    }

    pub(super) async fn cmd_create(
        &mut self,
        name: String,
        special_use: Vec<String>,
    ) -> CmdResult {
        let principal = principal!(self)?.clone();
        let path = normalize_path(&name);
        validate_path(&path)
            .map_err(|e| map_error(&self.log_prefix, e))?;

        let special_use = match &*special_use {
            [] => None,
            [role] => Some(
                role.parse::<SpecialUse>()
                    .map_err(|_| bad("Unknown special use"))?,
            ),
            _ => return Err(bad("At most one special use is supported")),
        };

        if self
            .storage
            .find_mailbox(principal.id, &path)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?
            .is_some()
        {
            return Err(map_error(
                &self.log_prefix,
                Error::MailboxExists,
            ));
        }

        let mailbox = Mailbox {
            id: MailboxId(ObjectId::new()),
            user: principal.id,
            path,
            uid_validity: Utc::now().timestamp() as u32,
            uid_next: 1,
            modify_index: Modseq::ZERO,
            subscribed: true,
            flags: Vec::new(),
            special_use,
        };
        self.storage
            .insert_mailbox(&mailbox)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;
        success()
    }

    pub(super) async fn cmd_rename(
        &mut self,
        from: String,
        to: String,
    ) -> CmdResult {
        let principal = principal!(self)?.clone();
        let from = normalize_path(&from);
        let to = normalize_path(&to);
        validate_path(&to)
            .map_err(|e| map_error(&self.log_prefix, e))?;

        if "INBOX" == from {
            return Err(Response {
                cond: Cond::No,
                code: Some(RespCode::Cannot),
                quip: Cow::Borrowed("INBOX cannot be renamed"),
            });
        }

        let mailbox = self
            .storage
            .find_mailbox(principal.id, &from)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?
            .ok_or_else(|| {
                map_error(&self.log_prefix, Error::NxMailbox)
            })?;

        // The destination, and every relocated descendant's destination,
        // must be free before anything moves; otherwise the source tree
        // is left untouched.
        if self
            .storage
            .find_mailbox(principal.id, &to)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?
            .is_some()
        {
            return Err(map_error(
                &self.log_prefix,
                Error::MailboxExists,
            ));
        }

        let descendants = self
            .storage
            .list_descendants(principal.id, &from)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;
        for descendant in &descendants {
            let new_path = format!(
                "{}{}",
                to,
                &descendant.path[from.len()..],
            );
            if self
                .storage
                .find_mailbox(principal.id, &new_path)
                .await
                .map_err(|e| map_error(&self.log_prefix, e))?
                .is_some()
            {
                return Err(map_error(
                    &self.log_prefix,
                    Error::MailboxExists,
                ));
            }
        }

        self.storage
            .set_mailbox_path(mailbox.id, &to)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;
        for descendant in &descendants {
            let new_path = format!(
                "{}{}",
                to,
                &descendant.path[from.len()..],
            );
            self.storage
                .set_mailbox_path(descendant.id, &new_path)
                .await
                .map_err(|e| map_error(&self.log_prefix, e))?;
        }

        success()
    }

    pub(super) async fn cmd_delete(&mut self, name: String) -> CmdResult {
        let principal = principal!(self)?.clone();
        let path = normalize_path(&name);

        if "INBOX" == path {
            return Err(Response {
                cond: Cond::No,
                code: Some(RespCode::Cannot),
                quip: Cow::Borrowed("INBOX cannot be deleted"),
            });
        }

        let mailbox = self
            .storage
            .find_mailbox(principal.id, &path)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?
            .ok_or_else(|| {
                map_error(&self.log_prefix, Error::NxMailbox)
            })?;

        if mailbox.special_use.is_some() {
            return Err(map_error(
                &self.log_prefix,
                Error::MailboxReserved,
            ));
        }

        self.storage
            .delete_mailbox(mailbox.id)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;

        let size = self
            .storage
            .aggregate_size(mailbox.id)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;
        self.storage
            .adjust_storage_used(principal.id, -(size as i64))
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;

        // Release blob references before dropping the documents. This is
        // best-effort cleanup; a missed unlink leaves an unreferenced
        // blob for a later sweep.
        let unlink = async {
            let mut cursor = self
                .storage
                .find_messages(doc! { "mailbox": mailbox.id.0 }, true)
                .await?;
            while let Some(message) = cursor.try_next().await? {
                let mut hashes = message.attachments.clone();
                hashes.push(message.body.clone());
                self.storage
                    .unlink_blobs(&hashes, message.id)
                    .await?;
            }
            Ok::<(), Error>(())
        };
        if let Err(e) = unlink.await {
            warn!(
                "{} Blob unlink during DELETE failed: {}",
                self.log_prefix, e,
            );
        }

        self.storage
            .delete_messages_in_mailbox(mailbox.id)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;
        self.storage
            .delete_journal(mailbox.id)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;

        success()
    }

    /// STATUS, answered from storage.
    ///
    /// RFC 3501 forbids STATUS on the currently selected mailbox but
    /// offers no failure semantics for it; we simply answer with the
    /// stored counts, which may legitimately run ahead of this session's
    /// snapshot.
    pub(super) async fn cmd_status(
        &mut self,
        name: String,
        items: Vec<s::StatusItem>,
        w: &mut ResponseWriter,
    ) -> CmdResult {
        let principal = principal!(self)?.clone();
        let path = normalize_path(&name);

        let mailbox = self
            .storage
            .find_mailbox(principal.id, &path)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?
            .ok_or_else(|| {
                map_error(&self.log_prefix, Error::NxMailbox)
            })?;

        let mut parts = Vec::new();
        for item in items {
            match item {
                s::StatusItem::Messages => {
                    let count = self
                        .storage
                        .count_messages(doc! { "mailbox": mailbox.id.0 })
                        .await
                        .map_err(|e| map_error(&self.log_prefix, e))?;
                    parts.push(format!("MESSAGES {}", count));
                }
                s::StatusItem::UidNext => {
                    parts.push(format!("UIDNEXT {}", mailbox.uid_next));
                }
                s::StatusItem::UidValidity => {
                    parts.push(format!(
                        "UIDVALIDITY {}",
                        mailbox.uid_validity,
                    ));
                }
                s::StatusItem::Unseen => {
                    let unseen = self
                        .storage
                        .count_messages(doc! {
                            "mailbox": mailbox.id.0,
                            "seen": false,
                        })
                        .await
                        .map_err(|e| map_error(&self.log_prefix, e))?;
                    parts.push(format!("UNSEEN {}", unseen));
                }
                s::StatusItem::HighestModseq => {
                    parts.push(format!(
                        "HIGHESTMODSEQ {}",
                        mailbox.modify_index.wire_value(),
                    ));
                }
            }
        }

        w.write_line(&format!(
            "* STATUS {} ({})",
            s::astring(&path),
            parts.join(" "),
        ))
        .await
        .map_err(|_| bad("I/O error"))?;
        success()
    }

    pub(super) async fn cmd_select(
        &mut self,
        name: String,
        condstore: bool,
        read_only: bool,
        w: &mut ResponseWriter,
    ) -> CmdResult {
        let principal = principal!(self)?.clone();
        let path = normalize_path(&name);

        // A failed SELECT leaves no mailbox selected either way.
        self.deselect();

        let mailbox = self
            .storage
            .find_mailbox(principal.id, &path)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?
            .ok_or_else(|| {
                map_error(&self.log_prefix, Error::NxMailbox)
            })?;

        let uids = self
            .storage
            .uid_list(mailbox.id)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;
        let first_unseen = self
            .storage
            .first_unseen_uid(mailbox.id)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;

        let selected = SelectedMailbox::new(
            mailbox.id,
            principal.id,
            path.clone(),
            self.session_id,
            read_only,
            uids,
            mailbox.modify_index,
        );
        let unseen_seqnum =
            first_unseen.and_then(|uid| selected.seqnum_of(uid));
        let exists = selected.exists();

        self.wake = Some(self.notifier.registry().subscribe(
            principal.id,
            &path,
            self.session_id,
        ));
        self.selected = Some(selected);
        if condstore {
            self.condstore_enabled = true;
        }

        let mut flags: Vec<Flag> = vec![
            Flag::Answered,
            Flag::Deleted,
            Flag::Draft,
            Flag::Flagged,
            Flag::Seen,
        ];
        flags.extend(mailbox.flags.iter().cloned());
        let flag_list = s::flag_list(&flags);

        let io = |_| bad("I/O error");
        w.write_line(&format!("* FLAGS {}", flag_list))
            .await
            .map_err(io)?;
        w.write_line(&format!("* {} EXISTS", exists))
            .await
            .map_err(io)?;
        w.write_line("* 0 RECENT").await.map_err(io)?;
        w.write_line(&format!(
            "* OK [PERMANENTFLAGS {} \\*)] Flags permitted",
            &flag_list[..flag_list.len() - 1],
        ))
        .await
        .map_err(io)?;
        w.write_line(&format!(
            "* OK [UIDVALIDITY {}] UIDs valid",
            mailbox.uid_validity,
        ))
        .await
        .map_err(io)?;
        w.write_line(&format!(
            "* OK [UIDNEXT {}] Predicted next UID",
            mailbox.uid_next,
        ))
        .await
        .map_err(io)?;
        w.write_line(&format!(
            "* OK [HIGHESTMODSEQ {}] Highest",
            mailbox.modify_index.wire_value(),
        ))
        .await
        .map_err(io)?;
        if let Some(unseen) = unseen_seqnum {
            w.write_line(&format!(
                "* OK [UNSEEN {}] First unseen",
                unseen.0.get(),
            ))
            .await
            .map_err(io)?;
        }

        Ok(Response {
            cond: Cond::Ok,
            code: Some(if read_only {
                RespCode::ReadOnly
            } else {
                RespCode::ReadWrite
            }),
            quip: Cow::Borrowed(if read_only {
                "Examine completed"
            } else {
                "Select completed"
            }),
        })
    }

    pub(super) async fn cmd_get_quota_root(
        &mut self,
        name: String,
        w: &mut ResponseWriter,
    ) -> CmdResult {
        let principal = principal!(self)?.clone();
        let path = normalize_path(&name);

        // Verify the mailbox exists; the only quota root is "".
        self.storage
            .find_mailbox(principal.id, &path)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?
            .ok_or_else(|| {
                map_error(&self.log_prefix, Error::NxMailbox)
            })?;

        w.write_line(&format!(
            "* QUOTAROOT {} \"\"",
            s::astring(&path),
        ))
        .await
        .map_err(|_| bad("I/O error"))?;
        self.write_quota(w).await?;
        success()
    }

    pub(super) async fn cmd_get_quota(
        &mut self,
        root: String,
        w: &mut ResponseWriter,
    ) -> CmdResult {
        principal!(self)?;
        if !root.is_empty() {
            return Err(map_error(&self.log_prefix, Error::NxMailbox));
        }
        self.write_quota(w).await?;
        success()
    }

    async fn write_quota(
        &mut self,
        w: &mut ResponseWriter,
    ) -> Result<(), Response> {
        let user = self.fetch_user().await?;
        let quota = if user.quota > 0 {
            user.quota
        } else {
            self.config.limits.max_storage
        };

        // RFC 2087 counts in units of 1024 octets.
        w.write_line(&format!(
            "* QUOTA \"\" (STORAGE {} {})",
            user.storage_used_clamped() / 1024,
            quota / 1024,
        ))
        .await
        .map_err(|_| bad("I/O error"))
    }

    /// Load the current user document (quota accounting changes between
    /// commands, so it is never cached on the session).
    pub(super) async fn fetch_user(&self) -> Result<User, Response> {
        let principal = principal!(self)?;
        self.storage
            .find_user(principal.id)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?
            .ok_or_else(|| bad("User no longer exists"))
    }
}

/// Normalize a client-supplied mailbox path: IMAP requires `INBOX` to be
/// case-insensitive, including as a hierarchy prefix.
pub(super) fn normalize_path(name: &str) -> String {
    let (first, rest) = match name.split_once('/') {
        Some((first, rest)) => (first, Some(rest)),
        None => (name, None),
    };

    let mut path = if first.eq_ignore_ascii_case("INBOX") {
        "INBOX".to_owned()
    } else {
        first.to_owned()
    };
    if let Some(rest) = rest {
        path.push('/');
        path.push_str(rest);
    }
    path
}

pub(super) fn validate_path(path: &str) -> Result<(), Error> {
    if path.is_empty()
        || path.starts_with('/')
        || path.ends_with('/')
        || path.contains("//")
        || path.contains('%')
        || path.contains('*')
        || path.bytes().any(|b| b < b' ' || 127 == b)
    {
        Err(Error::UnsafeName)
    } else {
        Ok(())
    }
}

/// Translate a LIST pattern into a regex: `*` matches anything, `%`
/// anything but the hierarchy delimiter.
pub(super) fn pattern_to_regex(
    pattern: &str,
) -> Result<Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '%' => out.push_str("[^/]*"),
            ch => out.push_str(&regex::escape(&ch.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn inbox_is_case_insensitive_as_name_and_prefix() {
        assert_eq!("INBOX", normalize_path("inbox"));
        assert_eq!("INBOX", normalize_path("InBox"));
        assert_eq!("INBOX/drafts", normalize_path("inbox/drafts"));
        assert_eq!("Archive", normalize_path("Archive"));
        // Only the INBOX segment folds; the rest is case-sensitive.
        assert_eq!("Foo/inbox", normalize_path("Foo/inbox"));
    }

    #[test]
    fn path_validation() {
        assert!(validate_path("INBOX").is_ok());
        assert!(validate_path("a/b/c").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("/leading").is_err());
        assert!(validate_path("trailing/").is_err());
        assert!(validate_path("dou//ble").is_err());
        assert!(validate_path("wild*card").is_err());
        assert!(validate_path("per%cent").is_err());
        assert!(validate_path("ctrl\x01char").is_err());
    }

    #[test]
    fn list_patterns() {
        let matcher = pattern_to_regex("*").unwrap();
        assert!(matcher.is_match("INBOX"));
        assert!(matcher.is_match("a/b"));

        let matcher = pattern_to_regex("%").unwrap();
        assert!(matcher.is_match("INBOX"));
        assert!(!matcher.is_match("a/b"));

        let matcher = pattern_to_regex("a/%").unwrap();
        assert!(matcher.is_match("a/b"));
        assert!(!matcher.is_match("a/b/c"));

        let matcher = pattern_to_regex("a.c*").unwrap();
        assert!(!matcher.is_match("aXc"));
        assert!(matcher.is_match("a.cde"));
    }
}
