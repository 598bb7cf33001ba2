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

use super::defs::*;
use crate::account::model::*;
use crate::imap::response_writer::ResponseWriter;
use crate::imap::syntax::{self as s, FetchCommand, FetchItem};
use crate::mime::{self, Section, SectionLeaf};
use crate::storage::{
    self, FlagWrite, JournalCommand, JournalEntry, Message, MessageId,
};
use crate::support::error::Error;

/// A deferred implicit-`\Seen` write.
struct SeenUpdate {
    message: MessageId,
    uid: Uid,
    flags: Vec<Flag>,
}

impl CommandProcessor {
    pub(super) async fn cmd_fetch(
        &mut self,
        cmd: FetchCommand,
        uid_mode: bool,
        w: &mut ResponseWriter,
    ) -> CmdResult {
        // CHANGEDSINCE is a CONDSTORE enabling action (RFC 7162).
        if cmd.changed_since.is_some() {
            self.condstore_enabled = true;
        }

        let uids = self.resolve_message_set(&cmd.messages, uid_mode)?;
        let (mailbox_id, user, path, read_only) = {
            let selected = selected!(self)?;
            (
                selected.id(),
                selected.user(),
                selected.path().to_owned(),
                selected.read_only(),
            )
        };

        let mut items = cmd.items;
        if uid_mode
            && !items.iter().any(|i| matches!(i, FetchItem::Uid))
        {
            items.insert(0, FetchItem::Uid);
        }

        // Body content only has to leave storage when a section is
        // actually being fetched.
        let metadata_only = !items
            .iter()
            .any(|i| matches!(i, FetchItem::Section { .. }));
        let mark_as_seen = !read_only
            && items.iter().any(|i| {
                matches!(i, FetchItem::Section { peek: false, .. })
            });
        let report_modseq = self.condstore_enabled
            || cmd.changed_since.is_some()
            || items.iter().any(|i| matches!(i, FetchItem::Modseq));

        let mut filter =
            storage::mailbox_uid_filter(mailbox_id, &uids);
        if let Some(changed_since) = cmd.changed_since {
            filter.insert(
                "modseq",
                doc! { "$gt": changed_since as i64 },
            );
        }

        let mut cursor = self
            .storage
            .find_messages(filter, metadata_only)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;

        let mut seen_queue: Vec<SeenUpdate> = Vec::new();

        while let Some(message) = cursor
            .try_next()
            .await
            .map_err(|e| map_error(&self.log_prefix, e.into()))?
        {
            let seqnum = self
                .selected
                .as_ref()
                .and_then(|sel| sel.seqnum_of(message.uid));
            // A row the snapshot doesn't know yet is reported by the
            // next EXISTS drain, not smuggled into this response.
            let Some(seqnum) = seqnum else {
                continue;
            };

            let mut flags = message.flags.clone();
            let implicit_seen = mark_as_seen && !message.seen;
            if implicit_seen {
                flags.insert(0, Flag::Seen);
            }

            let line = self
                .render_fetch_line(
                    seqnum,
                    &message,
                    &flags,
                    &items,
                    implicit_seen,
                    report_modseq,
                )
                .await?;
            w.write_line_bytes(&line)
                .await
                .map_err(|_| bad("I/O error"))?;

            if implicit_seen {
                seen_queue.push(SeenUpdate {
                    message: message.id,
                    uid: message.uid,
                    flags,
                });
                if seen_queue.len() >= BULK_BATCH {
                    self.flush_seen_queue(
                        &mut seen_queue,
                        mailbox_id,
                        user,
                        &path,
                    )
                    .await?;
                }
            }
        }

        self.flush_seen_queue(&mut seen_queue, mailbox_id, user, &path)
            .await?;

        success()
    }

    /// Render one `* N FETCH (…)` line, loading the raw blob lazily when
    /// a section is named.
    async fn render_fetch_line(
        &self,
        seqnum: Seqnum,
        message: &Message,
        flags: &[Flag],
        items: &[FetchItem],
        implicit_seen: bool,
        report_modseq: bool,
    ) -> Result<Vec<u8>, Response> {
        let mut parts: Vec<Vec<u8>> = Vec::new();
        let mut raw: Option<Vec<u8>> = None;
        let mut flags_rendered = false;
        let mut modseq_rendered = false;

        for item in items {
            match *item {
                FetchItem::Uid => {
                    parts.push(
                        format!("UID {}", u32::from(message.uid))
                            .into_bytes(),
                    );
                }
                FetchItem::Flags => {
                    flags_rendered = true;
                    parts.push(
                        format!("FLAGS {}", s::flag_list(flags))
                            .into_bytes(),
                    );
                }
                FetchItem::InternalDate => {
                    parts.push(
                        format!(
                            "INTERNALDATE {}",
                            s::date_time(&message.idate),
                        )
                        .into_bytes(),
                    );
                }
                FetchItem::Rfc822Size => {
                    parts.push(
                        format!("RFC822.SIZE {}", message.size)
                            .into_bytes(),
                    );
                }
                FetchItem::Envelope => {
                    parts.push(
                        format!(
                            "ENVELOPE {}",
                            s::envelope(&message.envelope),
                        )
                        .into_bytes(),
                    );
                }
                FetchItem::Body => {
                    parts.push(
                        format!(
                            "BODY {}",
                            s::body_structure(
                                &message.bodystructure,
                                false,
                            ),
                        )
                        .into_bytes(),
                    );
                }
                FetchItem::BodyStructure => {
                    parts.push(
                        format!(
                            "BODYSTRUCTURE {}",
                            s::body_structure(
                                &message.bodystructure,
                                true,
                            ),
                        )
                        .into_bytes(),
                    );
                }
                FetchItem::Modseq => {
                    modseq_rendered = true;
                    parts.push(
                        format!(
                            "MODSEQ ({})",
                            message.modseq.wire_value(),
                        )
                        .into_bytes(),
                    );
                }
                FetchItem::Section {
                    ref section,
                    partial,
                    ..
                } => {
                    if raw.is_none() {
                        // A failure here is fatal for the connection: a
                        // FETCH response cannot be abandoned midway
                        // without desyncing the client.
                        raw = Some(
                            self.storage
                                .get_blob(&message.body)
                                .await
                                .map_err(|_| {
                                    map_error(
                                        &self.log_prefix,
                                        Error::StreamFailure,
                                    )
                                })?,
                        );
                    }
                    let raw = raw.as_ref().unwrap();

                    let spec = render_section_spec(section, partial);
                    match mime::extract_section(raw, section) {
                        Some(mut content) => {
                            if let Some((offset, length)) = partial {
                                let start = (offset as usize)
                                    .min(content.len());
                                let end = start
                                    .saturating_add(length as usize)
                                    .min(content.len());
                                content =
                                    content[start..end].to_vec();
                            }
                            let mut part = spec.into_bytes();
                            part.extend_from_slice(
                                format!(" {{{}}}\r\n", content.len())
                                    .as_bytes(),
                            );
                            part.extend_from_slice(&content);
                            parts.push(part);
                        }
                        None => {
                            let mut part = spec.into_bytes();
                            part.extend_from_slice(b" NIL");
                            parts.push(part);
                        }
                    }
                }
            }
        }

        // An implicit \Seen must be visible in the response even when
        // FLAGS wasn't asked for.
        if implicit_seen && !flags_rendered {
            parts.push(
                format!("FLAGS {}", s::flag_list(flags)).into_bytes(),
            );
        }
        if report_modseq && !modseq_rendered {
            parts.push(
                format!("MODSEQ ({})", message.modseq.wire_value())
                    .into_bytes(),
            );
        }

        let mut line =
            format!("* {} FETCH (", seqnum.0.get()).into_bytes();
        for (ix, part) in parts.iter().enumerate() {
            if ix > 0 {
                line.push(b' ');
            }
            line.extend_from_slice(part);
        }
        line.push(b')');
        Ok(line)
    }

    /// Flush the deferred implicit-`\Seen` writes: one bulk write, one
    /// journal batch (ignoring this session, which already rendered the
    /// new flags), one fire.
    async fn flush_seen_queue(
        &mut self,
        queue: &mut Vec<SeenUpdate>,
        mailbox_id: crate::storage::MailboxId,
        user: crate::storage::UserId,
        path: &str,
    ) -> Result<(), Response> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut writes = Vec::with_capacity(queue.len());
        let mut entries = Vec::with_capacity(queue.len());
        for update in queue.drain(..) {
            let modseq = self
                .storage
                .next_modseq(mailbox_id)
                .await
                .map_err(|e| map_error(&self.log_prefix, e))?;
            writes.push(FlagWrite {
                message: update.message,
                flags: update.flags.clone(),
                modseq,
            });
            let mut entry = JournalEntry::new(
                mailbox_id,
                JournalCommand::Fetch,
                update.uid,
                modseq,
            );
            entry.message = Some(update.message);
            entry.flags = Some(update.flags);
            entry.ignore = Some(self.session_id);
            entries.push(entry);
        }

        self.storage
            .bulk_update_flags(&writes)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;
        self.notifier
            .add_entries(&entries)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;
        self.notifier.fire(user, path);
        Ok(())
    }
}

fn render_section_spec(
    section: &Section,
    partial: Option<(u32, u32)>,
) -> String {
    let mut spec = String::from("BODY[");
    for (ix, part) in section.path.iter().enumerate() {
        if ix > 0 {
            spec.push('.');
        }
        spec.push_str(&part.to_string());
    }

    let leaf = match section.leaf {
        SectionLeaf::Full => None,
        SectionLeaf::Header => Some("HEADER".to_owned()),
        SectionLeaf::Text => Some("TEXT".to_owned()),
        SectionLeaf::HeaderFields { ref fields, negate } => {
            let fields: Vec<String> = fields
                .iter()
                .map(|f| f.to_ascii_uppercase())
                .collect();
            Some(format!(
                "HEADER.FIELDS{} ({})",
                if negate { ".NOT" } else { "" },
                fields.join(" "),
            ))
        }
    };
    if let Some(leaf) = leaf {
        if !section.path.is_empty() {
            spec.push('.');
        }
        spec.push_str(&leaf);
    }
    spec.push(']');

    if let Some((offset, _)) = partial {
        spec.push_str(&format!("<{}>", offset));
    }
    spec
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn section_specs_render_canonically() {
        assert_eq!(
            "BODY[]",
            render_section_spec(&Section::full(), None),
        );
        assert_eq!(
            "BODY[1.2]",
            render_section_spec(
                &Section {
                    path: vec![1, 2],
                    leaf: SectionLeaf::Full,
                },
                None,
            ),
        );
        assert_eq!(
            "BODY[1.HEADER]",
            render_section_spec(
                &Section {
                    path: vec![1],
                    leaf: SectionLeaf::Header,
                },
                None,
            ),
        );
        assert_eq!(
            "BODY[HEADER.FIELDS.NOT (SUBJECT)]<512>",
            render_section_spec(
                &Section {
                    path: vec![],
                    leaf: SectionLeaf::HeaderFields {
                        fields: vec!["subject".to_owned()],
                        negate: true,
                    },
                },
                Some((512, 128)),
            ),
        );
    }
}
