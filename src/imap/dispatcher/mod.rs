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

//! The command dispatcher.
//!
//! As with `account`, this module is split into several submodules for
//! manageability but is best thought of as one single module. Each
//! handler performs its account/storage operations, streams any untagged
//! responses, and produces the tagged status; the shared driver in
//! `handle_command` then drains cross-session notifications at the
//! protocol moment the session-state rules allow and appends the tagged
//! line.

// principal! and selected! are macros instead of methods on
// CommandProcessor since there is no way to express that they borrow only
// one field; as methods, the returned value would be considered to borrow
// the whole processor.
macro_rules! principal {
    ($this:expr) => {
        $this.principal.as_ref().ok_or_else(|| {
            crate::imap::dispatcher::defs::bad("Not logged in")
        })
    };
}

macro_rules! selected {
    ($this:expr) => {
        $this.selected.as_mut().ok_or_else(|| {
            crate::imap::dispatcher::defs::bad("No mailbox selected")
        })
    };
}

mod auth;
mod defs;
mod fetch;
mod flags;
mod mailboxes;
mod messages;
mod search;

pub use self::defs::{AfterCommand, CommandProcessor};

use log::{error, info};

use self::defs::*;
use super::response_writer::ResponseWriter;
use super::syntax::{self as s, Command, CommandLine, UidCommand};
use crate::account::model::SeqRange;
use crate::account::selected::FlushPlan;
use crate::support::error::Error;

impl CommandProcessor {
    /// Write the greeting line.
    pub async fn greet(
        &self,
        w: &mut ResponseWriter,
    ) -> Result<(), Error> {
        w.write_line(&format!(
            "* OK [CAPABILITY {}] {}",
            self.capability_line(),
            TAGLINE,
        ))
        .await?;
        Ok(())
    }

    /// Handle one complete command: run the handler, drain pending
    /// notifications at the permitted depth, and write the tagged
    /// completion.
    pub async fn handle_command(
        &mut self,
        cmdline: CommandLine,
        w: &mut ResponseWriter,
    ) -> Result<AfterCommand, Error> {
        // FETCH, STORE, and SEARCH (the non-UID versions) are the cursed
        // commands that forbid updating the sequence-number mapping in
        // their wake.
        let full_poll = !matches!(
            cmdline.cmd,
            Command::Fetch(..)
                | Command::Store(..)
                | Command::Search(..),
        );

        let mut after = AfterCommand::Continue;

        let res = match cmdline.cmd {
            Command::Capability => self.cmd_capability(w).await,
            Command::Noop => success(),
            Command::Check => success(),
            Command::LogOut => {
                after = AfterCommand::Close;
                self.cmd_log_out(w).await
            }
            Command::StartTls => {
                let res = self.cmd_start_tls();
                if res.is_ok() {
                    after = AfterCommand::StartTls;
                }
                res
            }
            Command::Idle => {
                panic!("IDLE should be dispatched by server.rs")
            }
            Command::Id(pairs) => self.cmd_id(pairs, w).await,
            Command::Namespace => self.cmd_namespace(w).await,
            Command::Enable(exts) => self.cmd_enable(exts, w).await,

            Command::LogIn { userid, password } => {
                self.cmd_log_in(userid, password).await
            }

            Command::List { reference, pattern } => {
                self.cmd_list(reference, pattern, false, w).await
            }
            Command::Lsub { reference, pattern } => {
                self.cmd_list(reference, pattern, true, w).await
            }
            Command::Subscribe(name) => {
                self.cmd_set_subscribed(name, true).await
            }
            Command::Unsubscribe(name) => {
                self.cmd_set_subscribed(name, false).await
            }
            Command::Create { name, special_use } => {
                self.cmd_create(name, special_use).await
            }
            Command::Rename { from, to } => {
                self.cmd_rename(from, to).await
            }
            Command::Delete(name) => self.cmd_delete(name).await,
            Command::Status { name, items } => {
                self.cmd_status(name, items, w).await
            }
            Command::Select { name, condstore } => {
                self.cmd_select(name, condstore, false, w).await
            }
            Command::Examine { name, condstore } => {
                self.cmd_select(name, condstore, true, w).await
            }
            Command::Close => self.cmd_close(w).await,
            Command::Unselect => self.cmd_unselect(),
            Command::Expunge => self.cmd_expunge(None, w).await,

            Command::Append {
                mailbox,
                flags,
                date,
                message,
            } => self.cmd_append(mailbox, flags, date, message).await,

            Command::Copy { messages, mailbox } => {
                self.cmd_copy(messages, mailbox, false, w).await
            }
            Command::Move { messages, mailbox } => {
                self.cmd_move(messages, mailbox, false, w).await
            }
            Command::Store(cmd) => self.cmd_store(cmd, false, w).await,
            Command::Fetch(cmd) => self.cmd_fetch(cmd, false, w).await,
            Command::Search(cmd) => {
                self.cmd_search(cmd, false, w).await
            }

            Command::GetQuotaRoot(name) => {
                self.cmd_get_quota_root(name, w).await
            }
            Command::GetQuota(root) => {
                self.cmd_get_quota(root, w).await
            }

            Command::Uid(uid) => match *uid {
                UidCommand::Copy { messages, mailbox } => {
                    self.cmd_copy(messages, mailbox, true, w).await
                }
                UidCommand::Move { messages, mailbox } => {
                    self.cmd_move(messages, mailbox, true, w).await
                }
                UidCommand::Expunge(uids) => {
                    self.cmd_expunge(Some(uids), w).await
                }
                UidCommand::Store(cmd) => {
                    self.cmd_store(cmd, true, w).await
                }
                UidCommand::Fetch(cmd) => {
                    self.cmd_fetch(cmd, true, w).await
                }
                UidCommand::Search(cmd) => {
                    self.cmd_search(cmd, true, w).await
                }
            },
        };

        if res.is_ok() && AfterCommand::Continue == after {
            if let Err(e) = self.drain_notifications(full_poll, w).await
            {
                if let Error::Io(e) = e {
                    return Err(Error::Io(e));
                }
                error!("{} Notification drain failed: {}",
                       self.log_prefix, e);
            }
        }

        let response = match res {
            Ok(response) | Err(response) => response,
        };

        if Cond::Bye == response.cond {
            w.write_line(&format!("* {}", response.render())).await?;
            return Ok(AfterCommand::Destroy);
        }

        w.write_line(&format!(
            "{} {}",
            cmdline.tag,
            response.render(),
        ))
        .await?;
        Ok(after)
    }

    /// Report a command that could not be parsed.
    pub async fn handle_bad_command(
        &mut self,
        tag: Option<String>,
        message: &str,
        w: &mut ResponseWriter,
    ) -> Result<(), Error> {
        info!("{} Rejected command: {}", self.log_prefix, message);
        match tag {
            Some(tag) => {
                w.write_line(&format!("{} BAD {}", tag, message)).await?
            }
            None => {
                w.write_line(&format!("* BAD {}", message)).await?
            }
        }
        Ok(())
    }

    /// Drain the journal and emit any pending notifications for the
    /// selected mailbox. `full` permits EXISTS/EXPUNGE reporting; a mini
    /// drain only echoes flag changes.
    pub async fn drain_notifications(
        &mut self,
        full: bool,
        w: &mut ResponseWriter,
    ) -> Result<(), Error> {
        if self.selected.is_none() {
            return Ok(());
        }

        // Consume the coalesced wake-up, if any; we are draining anyway.
        if let Some(ref mut wake) = self.wake {
            let _ = wake.try_recv();
        }

        let selected = self.selected.as_mut().unwrap();
        let entries = self
            .storage
            .journal_since(selected.id(), selected.snapshot_modseq())
            .await?;
        selected.offer_entries(entries);

        let plan = if full {
            selected.flush_full()
        } else {
            selected.flush_mini()
        };
        let drained = selected.snapshot_modseq().raw();

        emit_plan(
            &plan,
            self.condstore_enabled,
            self.qresync_enabled,
            w,
        )
        .await?;

        self.notifier
            .note_drained(
                selected.user(),
                selected.path(),
                selected.id(),
                self.session_id,
                drained,
            )
            .await;

        Ok(())
    }

    /// Whether a wake-up for the selected mailbox is pending (IDLE).
    pub async fn await_wake(&mut self) {
        match self.wake {
            Some(ref mut wake) => {
                let _ = wake.recv().await;
            }
            // Not selected; IDLE can only be woken by the connection.
            None => std::future::pending::<()>().await,
        }
    }

    async fn cmd_capability(
        &mut self,
        w: &mut ResponseWriter,
    ) -> CmdResult {
        w.write_line(&format!("* CAPABILITY {}", self.capability_line()))
            .await
            .map_err(|_| bad("I/O error"))?;
        success()
    }

    async fn cmd_log_out(&mut self, w: &mut ResponseWriter) -> CmdResult {
        self.deselect();
        self.logged_out = true;
        w.write_line("* BYE It was nice talking to you")
            .await
            .map_err(|_| bad("I/O error"))?;
        success()
    }

    fn cmd_start_tls(&mut self) -> CmdResult {
        if self.tls_active {
            Err(bad("TLS already active"))
        } else if self.config.listener.ignore_starttls {
            Err(bad("STARTTLS is disabled here"))
        } else {
            self.tls_active = true;
            Ok(ok("Begin TLS negotiation now"))
        }
    }

    async fn cmd_id(
        &mut self,
        pairs: Vec<(String, Option<String>)>,
        w: &mut ResponseWriter,
    ) -> CmdResult {
        // Only take action on the first ID exchange so the log prefix
        // doesn't keep accumulating.
        if !self.id_exchanged {
            let mut ua_name = None;
            let mut ua_version = None;
            for (key, value) in &pairs {
                if key.eq_ignore_ascii_case("name") {
                    ua_name = value.clone();
                }
                if key.eq_ignore_ascii_case("version") {
                    ua_version = value.clone();
                }
            }
            if ua_name.is_some() {
                self.log_prefix.set_user_agent(ua_name, ua_version);
            }
            self.id_exchanged = true;
            info!("{} ID exchanged", self.log_prefix);
        }

        let id = &self.config.identification;
        let mut fields = vec![
            (
                "name",
                id.get("name").map_or(env!("CARGO_PKG_NAME"), |v| v),
            ),
            (
                "version",
                id.get("version")
                    .map_or(env!("CARGO_PKG_VERSION"), |v| v),
            ),
        ];
        if let Some(vendor) = id.get("vendor") {
            fields.push(("vendor", vendor));
        }

        let rendered: Vec<String> = fields
            .iter()
            .map(|(k, v)| format!("{} {}", s::astring(k), s::astring(v)))
            .collect();
        w.write_line(&format!("* ID ({})", rendered.join(" ")))
            .await
            .map_err(|_| bad("I/O error"))?;
        success()
    }

    async fn cmd_namespace(
        &mut self,
        w: &mut ResponseWriter,
    ) -> CmdResult {
        principal!(self)?;
        w.write_line("* NAMESPACE ((\"\" \"/\")) NIL NIL")
            .await
            .map_err(|_| bad("I/O error"))?;
        success()
    }

    async fn cmd_enable(
        &mut self,
        exts: Vec<String>,
        w: &mut ResponseWriter,
    ) -> CmdResult {
        principal!(self)?;

        let mut enabled = Vec::new();
        // Per RFC 5161, unknown or non-ENABLE-able extensions are
        // silently ignored.
        for ext in exts {
            if ext.eq_ignore_ascii_case("CONDSTORE") {
                self.condstore_enabled = true;
                enabled.push(ext);
            } else if ext.eq_ignore_ascii_case("QRESYNC") {
                self.condstore_enabled = true;
                self.qresync_enabled = true;
                enabled.push(ext);
            }
        }

        w.write_line(&format!("* ENABLED {}", enabled.join(" ")))
            .await
            .map_err(|_| bad("I/O error"))?;
        Ok(ok(if enabled.is_empty() {
            "Nothing enabled"
        } else {
            "Extensions enabled"
        }))
    }

    /// Drop the selected state and its notifier subscription.
    pub(super) fn deselect(&mut self) {
        if let Some(selected) = self.selected.take() {
            self.notifier.registry().unsubscribe(
                selected.user(),
                selected.path(),
                self.session_id,
            );
        }
        self.wake = None;
    }
}

/// Emit a flush plan in its required order: EXISTS, then FETCH, then
/// EXPUNGE (as VANISHED for QRESYNC sessions).
pub(super) async fn emit_plan(
    plan: &FlushPlan,
    condstore: bool,
    qresync: bool,
    w: &mut ResponseWriter,
) -> Result<(), Error> {
    for &count in &plan.exists {
        w.write_line(&format!("* {} EXISTS", count)).await?;
    }

    for fetch in &plan.fetch {
        let mut attrs = format!("FLAGS {}", s::flag_list(&fetch.flags));
        if condstore {
            attrs.push_str(&format!(
                " MODSEQ ({})",
                fetch.modseq.wire_value(),
            ));
        }
        w.write_line(&format!(
            "* {} FETCH ({})",
            fetch.seqnum.0.get(),
            attrs,
        ))
        .await?;
    }

    if !plan.expunge.is_empty() {
        if qresync {
            let mut vanished = SeqRange::new();
            let mut uids: Vec<_> =
                plan.expunge.iter().map(|&(_, uid)| uid).collect();
            uids.sort_unstable();
            for uid in uids {
                vanished.append(uid);
            }
            w.write_line(&format!("* VANISHED {}", vanished)).await?;
        } else {
            for &(seqnum, _) in &plan.expunge {
                w.write_line(&format!("* {} EXPUNGE", seqnum.0.get()))
                    .await?;
            }
        }
    }

    Ok(())
}
