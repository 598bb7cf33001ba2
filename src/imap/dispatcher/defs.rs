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
use std::net::IpAddr;
use std::sync::Arc;

use log::error;

use crate::account::auth::{Authenticator, Principal};
use crate::account::messages::MessageHandler;
use crate::account::model::*;
use crate::account::notify::{Notifier, WakeReceiver};
use crate::account::selected::SelectedMailbox;
use crate::storage::{SessionId, Storage};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::SystemConfig;

pub(super) static TAGLINE: &str = concat!(
    "On document-store wings (",
    env!("CARGO_PKG_NAME"),
    " ",
    env!("CARGO_PKG_VERSION"),
    " ready)"
);

/// Capabilities that hold regardless of connection state.
pub(super) static CAPABILITIES: &[&str] = &[
    "IMAP4rev1",
    "CHILDREN",
    "CONDSTORE",
    "CREATE-SPECIAL-USE",
    "ENABLE",
    "ID",
    "IDLE",
    "LITERAL+",
    "MOVE",
    "NAMESPACE",
    "QRESYNC",
    "QUOTA",
    "SPECIAL-USE",
    "UIDPLUS",
    "UNSELECT",
];

/// Bulk threshold: flag writes and their journal entries are flushed to
/// storage in groups of this many rows.
pub(super) const BULK_BATCH: usize = 150;

/// The condition of a tagged or untagged status response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Cond {
    Ok,
    No,
    Bad,
    Bye,
}

impl Cond {
    pub(super) fn name(self) -> &'static str {
        match self {
            Cond::Ok => "OK",
            Cond::No => "NO",
            Cond::Bad => "BAD",
            Cond::Bye => "BYE",
        }
    }
}

/// Response codes this server emits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) enum RespCode {
    AlreadyExists,
    Nonexistent,
    Cannot,
    TryCreate,
    OverQuota,
    TooBig,
    AuthenticationFailed,
    ClientBug,
    ServerBug,
    ReadOnly,
    ReadWrite,
    UidValidity(u32),
    UidNext(u32),
    Unseen(u32),
    PermanentFlags(String),
    HighestModseq(u64),
    AppendUid { uid_validity: u32, uid: Uid },
    CopyUid { uid_validity: u32, from: String, to: String },
    Modified(String),
    Capability(String),
}

impl RespCode {
    pub(super) fn render(&self) -> String {
        match *self {
            RespCode::AlreadyExists => "ALREADYEXISTS".to_owned(),
            RespCode::Nonexistent => "NONEXISTENT".to_owned(),
            RespCode::Cannot => "CANNOT".to_owned(),
            RespCode::TryCreate => "TRYCREATE".to_owned(),
            RespCode::OverQuota => "OVERQUOTA".to_owned(),
            RespCode::TooBig => "TOOBIG".to_owned(),
            RespCode::AuthenticationFailed => {
                "AUTHENTICATIONFAILED".to_owned()
            }
            RespCode::ClientBug => "CLIENTBUG".to_owned(),
            RespCode::ServerBug => "SERVERBUG".to_owned(),
            RespCode::ReadOnly => "READ-ONLY".to_owned(),
            RespCode::ReadWrite => "READ-WRITE".to_owned(),
            RespCode::UidValidity(v) => format!("UIDVALIDITY {}", v),
            RespCode::UidNext(v) => format!("UIDNEXT {}", v),
            RespCode::Unseen(v) => format!("UNSEEN {}", v),
            RespCode::PermanentFlags(ref flags) => {
                format!("PERMANENTFLAGS {}", flags)
            }
            RespCode::HighestModseq(v) => {
                format!("HIGHESTMODSEQ {}", v)
            }
            RespCode::AppendUid { uid_validity, uid } => format!(
                "APPENDUID {} {}",
                uid_validity,
                u32::from(uid),
            ),
            RespCode::CopyUid {
                uid_validity,
                ref from,
                ref to,
            } => format!("COPYUID {} {} {}", uid_validity, from, to),
            RespCode::Modified(ref set) => format!("MODIFIED {}", set),
            RespCode::Capability(ref caps) => {
                format!("CAPABILITY {}", caps)
            }
        }
    }
}

/// A status response, tagged or not depending on where it is used.
#[derive(Clone, Debug)]
pub(super) struct Response {
    pub(super) cond: Cond,
    pub(super) code: Option<RespCode>,
    pub(super) quip: Cow<'static, str>,
}

impl Response {
    pub(super) fn render(&self) -> String {
        match self.code {
            Some(ref code) => format!(
                "{} [{}] {}",
                self.cond.name(),
                code.render(),
                self.quip,
            ),
            None => format!("{} {}", self.cond.name(), self.quip),
        }
    }
}

/// Used just for the convenient `?` operator. We mostly don't distinguish
/// `Ok` from `Err`; the contained value is sent down the wire either way,
/// though on `Err` no notification flush happens.
pub(super) type CmdResult = Result<Response, Response>;

/// Return value from an operation that can either succeed with a value,
/// or fail with an IMAP response.
pub(super) type PartialResult<T> = Result<T, Response>;

pub(super) fn ok(quip: &'static str) -> Response {
    Response {
        cond: Cond::Ok,
        code: None,
        quip: Cow::Borrowed(quip),
    }
}

pub(super) fn success() -> CmdResult {
    Ok(ok("Completed"))
}

pub(super) fn bad(quip: impl Into<Cow<'static, str>>) -> Response {
    Response {
        cond: Cond::Bad,
        code: None,
        quip: quip.into(),
    }
}

/// Map an account-layer error to its protocol response, per the error
/// taxonomy: protocol-level errors get their response code, transient
/// storage errors keep the connection with a generic `NO`, and stream
/// failures surface as `BYE`.
pub(super) fn map_error(log_prefix: &LogPrefix, e: Error) -> Response {
    let (cond, code, quip): (Cond, Option<RespCode>, Cow<'static, str>) =
        match e {
            Error::NxMailbox => (
                Cond::No,
                Some(RespCode::Nonexistent),
                Cow::Borrowed("No such mailbox"),
            ),
            Error::MailboxExists => (
                Cond::No,
                Some(RespCode::AlreadyExists),
                Cow::Borrowed("Mailbox already exists"),
            ),
            Error::NxDestination => (
                Cond::No,
                Some(RespCode::TryCreate),
                Cow::Borrowed("No such destination mailbox"),
            ),
            Error::MailboxReserved => (
                Cond::No,
                Some(RespCode::Cannot),
                Cow::Borrowed("Mailbox is reserved for a special use"),
            ),
            Error::MailboxReadOnly => (
                Cond::No,
                Some(RespCode::Cannot),
                Cow::Borrowed("Mailbox is open read-only"),
            ),
            Error::OverQuota => (
                Cond::No,
                Some(RespCode::OverQuota),
                Cow::Borrowed("Storage quota exceeded"),
            ),
            Error::MessageTooLarge => (
                Cond::No,
                Some(RespCode::TooBig),
                Cow::Borrowed("Message larger than the accepted maximum"),
            ),
            Error::InvalidCredentials => (
                Cond::No,
                Some(RespCode::AuthenticationFailed),
                Cow::Borrowed("Invalid credentials"),
            ),
            Error::RateLimited => (
                Cond::No,
                None,
                Cow::Borrowed("Too many logins, try again later"),
            ),
            Error::BadSeqnum => (
                Cond::Bad,
                Some(RespCode::ClientBug),
                Cow::Borrowed("Message sequence number out of range"),
            ),
            Error::NxFlag | Error::UnsafeName => (
                Cond::Bad,
                None,
                Cow::Owned(e.to_string()),
            ),
            Error::StreamFailure => (
                Cond::Bye,
                None,
                Cow::Borrowed("Body stream failed; closing connection"),
            ),
            e => {
                error!("{} Unhandled internal error: {}", log_prefix, e);
                (
                    Cond::No,
                    Some(RespCode::ServerBug),
                    Cow::Borrowed("Internal error"),
                )
            }
        };

    Response { cond, code, quip }
}

/// What the connection loop should do after a command completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AfterCommand {
    Continue,
    /// LOGOUT: say goodbye and close.
    Close,
    /// The tagged OK to STARTTLS has been sent; wrap the stream.
    StartTls,
    /// A fatal error was sent as BYE; destroy the connection.
    Destroy,
}

/// Receives parsed commands and emits response lines.
///
/// While primarily a translation layer between the wire grammar and the
/// account operations, this also owns the high-level IMAP state: the
/// authenticated principal, the selected mailbox, and which extensions
/// the client has enabled.
pub struct CommandProcessor {
    pub(super) log_prefix: LogPrefix,
    pub(super) config: Arc<SystemConfig>,
    pub(super) storage: Arc<Storage>,
    pub(super) notifier: Arc<Notifier>,
    pub(super) handler: Arc<MessageHandler>,
    pub(super) authenticator: Arc<Authenticator>,

    pub(super) session_id: SessionId,
    pub(super) peer: IpAddr,
    pub(super) tls_active: bool,

    pub(super) principal: Option<Principal>,
    pub(super) selected: Option<SelectedMailbox>,
    pub(super) wake: Option<WakeReceiver>,

    pub(super) condstore_enabled: bool,
    pub(super) qresync_enabled: bool,
    pub(super) id_exchanged: bool,
    pub(super) logged_out: bool,
}

impl CommandProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log_prefix: LogPrefix,
        config: Arc<SystemConfig>,
        storage: Arc<Storage>,
        notifier: Arc<Notifier>,
        handler: Arc<MessageHandler>,
        authenticator: Arc<Authenticator>,
        session_id: SessionId,
        peer: IpAddr,
        tls_active: bool,
    ) -> Self {
        Self {
            log_prefix,
            config,
            storage,
            notifier,
            handler,
            authenticator,
            session_id,
            peer,
            tls_active,
            principal: None,
            selected: None,
            wake: None,
            condstore_enabled: false,
            qresync_enabled: false,
            id_exchanged: false,
            logged_out: false,
        }
    }

    pub fn logged_out(&self) -> bool {
        self.logged_out
    }

    pub fn log_prefix(&self) -> &LogPrefix {
        &self.log_prefix
    }

    pub fn has_selected(&self) -> bool {
        self.selected.is_some()
    }

    pub(super) fn capability_line(&self) -> String {
        let mut caps: Vec<&str> = CAPABILITIES.to_vec();
        if !self.tls_active
            && !self.config.listener.secure
            && !self.config.listener.ignore_starttls
        {
            caps.push("STARTTLS");
        }
        caps.join(" ")
    }

    pub(super) fn parse_seqnum_range(
        &self,
        raw: &str,
    ) -> PartialResult<SeqRange<Seqnum>> {
        let selected = self.selected.as_ref().ok_or_else(|| {
            bad("No mailbox selected")
        })?;

        let max = selected.max_seqnum();
        let splat = Seqnum::of(max.max(1)).unwrap();
        let seqrange =
            SeqRange::parse(raw, splat).ok_or_else(|| {
                bad("Unparsable sequence set")
            })?;

        if seqrange.max().unwrap_or(0) > max {
            // Referencing a sequence number outside the snapshot is a
            // protocol violation.
            return Err(Response {
                cond: Cond::Bad,
                code: Some(RespCode::ClientBug),
                quip: Cow::Borrowed(
                    "Message sequence number out of range",
                ),
            });
        }

        Ok(seqrange)
    }

    pub(super) fn parse_uid_range(
        &self,
        raw: &str,
    ) -> PartialResult<SeqRange<Uid>> {
        let selected = self.selected.as_ref().ok_or_else(|| {
            bad("No mailbox selected")
        })?;

        // The client is explicitly allowed to name UIDs that don't exist,
        // so there is nothing to range-check here.
        SeqRange::parse(raw, selected.max_uid())
            .ok_or_else(|| bad("Unparsable sequence set"))
    }
}
