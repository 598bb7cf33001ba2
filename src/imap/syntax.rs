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

//! The wire grammar: command lines in, response text out.
//!
//! The tokenizer and command compiler here are the narrow surface between
//! raw octets and the dispatcher; nothing downstream of this module ever
//! touches bytes. Literals are framed by the request reader and handed in
//! as a parallel list, with their `{n}` markers left in the line as
//! placeholders.

use std::collections::VecDeque;
use std::fmt::Write as _;

use chrono::prelude::*;

use crate::account::model::{
    DateComparison, Flag, SearchQuery, SeqRange, Seqnum, SizeComparison,
    StoreAction, Uid,
};
use crate::mime::{Address, BodyStructure, Envelope, Section, SectionLeaf};

// ==================== Commands ====================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    pub tag: String,
    pub cmd: Command,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Capability,
    Noop,
    Check,
    LogOut,
    StartTls,
    Idle,
    Id(Vec<(String, Option<String>)>),
    Namespace,
    Enable(Vec<String>),
    LogIn {
        userid: String,
        password: String,
    },
    List {
        reference: String,
        pattern: String,
    },
    Lsub {
        reference: String,
        pattern: String,
    },
    Subscribe(String),
    Unsubscribe(String),
    Create {
        name: String,
        special_use: Vec<String>,
    },
    Rename {
        from: String,
        to: String,
    },
    Delete(String),
    Status {
        name: String,
        items: Vec<StatusItem>,
    },
    Select {
        name: String,
        condstore: bool,
    },
    Examine {
        name: String,
        condstore: bool,
    },
    Close,
    Unselect,
    Expunge,
    Append {
        mailbox: String,
        flags: Vec<Flag>,
        date: Option<DateTime<Utc>>,
        message: Vec<u8>,
    },
    Copy {
        messages: String,
        mailbox: String,
    },
    Move {
        messages: String,
        mailbox: String,
    },
    Store(StoreCommand),
    Fetch(FetchCommand),
    Search(SearchCommand),
    GetQuotaRoot(String),
    GetQuota(String),
    Uid(Box<UidCommand>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UidCommand {
    Copy { messages: String, mailbox: String },
    Move { messages: String, mailbox: String },
    Expunge(String),
    Store(StoreCommand),
    Fetch(FetchCommand),
    Search(SearchCommand),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusItem {
    Messages,
    UidNext,
    UidValidity,
    Unseen,
    HighestModseq,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreCommand {
    pub messages: String,
    pub action: StoreAction,
    pub silent: bool,
    pub flags: Vec<Flag>,
    pub unchanged_since: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchCommand {
    pub messages: String,
    pub items: Vec<FetchItem>,
    pub changed_since: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchItem {
    Uid,
    Flags,
    InternalDate,
    Rfc822Size,
    Envelope,
    Body,
    BodyStructure,
    Modseq,
    /// `BODY[…]` / `BODY.PEEK[…]`, with an optional `<offset.length>`
    /// partial.
    Section {
        section: Section,
        peek: bool,
        partial: Option<(u32, u32)>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchCommand {
    pub queries: Vec<SearchQuery>,
}

// ==================== Parse errors ====================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

type PResult<T> = Result<T, ParseError>;

// ==================== Tokenizer ====================

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    /// An unquoted word. Bracketed suffixes (`BODY[…]<…>`) are kept
    /// within one atom, spaces and all.
    Atom(String),
    Quoted(String),
    Literal(Vec<u8>),
    LParen,
    RParen,
}

fn tokenize(
    line: &[u8],
    mut literals: VecDeque<Vec<u8>>,
) -> PResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut ix = 0;

    while ix < line.len() {
        match line[ix] {
            b' ' => ix += 1,
            b'(' => {
                tokens.push(Token::LParen);
                ix += 1;
            }
            b')' => {
                tokens.push(Token::RParen);
                ix += 1;
            }
            b'"' => {
                let mut value = String::new();
                ix += 1;
                loop {
                    match line.get(ix) {
                        None => {
                            return Err(ParseError::new(
                                "unterminated quoted string",
                            ))
                        }
                        Some(b'"') => {
                            ix += 1;
                            break;
                        }
                        Some(b'\\') => {
                            let escaped =
                                line.get(ix + 1).ok_or_else(|| {
                                    ParseError::new(
                                        "dangling backslash",
                                    )
                                })?;
                            value.push(*escaped as char);
                            ix += 2;
                        }
                        Some(&b) => {
                            value.push(b as char);
                            ix += 1;
                        }
                    }
                }
                tokens.push(Token::Quoted(value));
            }
            b'{' => {
                let close = line[ix..]
                    .iter()
                    .position(|&b| b'}' == b)
                    .ok_or_else(|| {
                        ParseError::new("unterminated literal marker")
                    })?;
                let literal = literals.pop_front().ok_or_else(|| {
                    ParseError::new("literal marker without literal")
                })?;
                tokens.push(Token::Literal(literal));
                ix += close + 1;
            }
            _ => {
                let start = ix;
                let mut bracket_depth = 0u32;
                while ix < line.len() {
                    match line[ix] {
                        b'[' => bracket_depth += 1,
                        b']' => {
                            bracket_depth =
                                bracket_depth.saturating_sub(1)
                        }
                        b' ' | b'(' | b')' | b'"' | b'{'
                            if 0 == bracket_depth =>
                        {
                            break
                        }
                        _ => {}
                    }
                    ix += 1;
                }
                tokens.push(Token::Atom(
                    String::from_utf8_lossy(&line[start..ix])
                        .into_owned(),
                ));
            }
        }
    }

    Ok(tokens)
}

// ==================== Token cursor ====================

struct Cursor {
    tokens: VecDeque<Token>,
}

impl Cursor {
    fn next(&mut self) -> PResult<Token> {
        self.tokens
            .pop_front()
            .ok_or_else(|| ParseError::new("unexpected end of command"))
    }

    fn peek_is_lparen(&self) -> bool {
        matches!(self.tokens.front(), Some(Token::LParen))
    }

    fn at_end(&self) -> bool {
        self.tokens.is_empty()
    }

    fn atom(&mut self) -> PResult<String> {
        match self.next()? {
            Token::Atom(a) => Ok(a),
            t => Err(ParseError::new(format!("expected atom, got {:?}", t))),
        }
    }

    /// An atom, quoted string, or literal, as text.
    fn astring(&mut self) -> PResult<String> {
        match self.next()? {
            Token::Atom(a) => Ok(a),
            Token::Quoted(q) => Ok(q),
            Token::Literal(l) => {
                Ok(String::from_utf8_lossy(&l).into_owned())
            }
            t => Err(ParseError::new(format!(
                "expected string, got {:?}",
                t
            ))),
        }
    }

    fn literal(&mut self) -> PResult<Vec<u8>> {
        match self.next()? {
            Token::Literal(l) => Ok(l),
            t => Err(ParseError::new(format!(
                "expected literal, got {:?}",
                t
            ))),
        }
    }

    fn expect_lparen(&mut self) -> PResult<()> {
        match self.next()? {
            Token::LParen => Ok(()),
            t => Err(ParseError::new(format!("expected (, got {:?}", t))),
        }
    }

    fn number(&mut self) -> PResult<u64> {
        let atom = self.atom()?;
        atom.parse()
            .map_err(|_| ParseError::new(format!("bad number: {}", atom)))
    }

    /// Parenthesized list of atoms/strings; also accepts a bare single
    /// item where RFC 3501 allows it.
    fn paren_list(&mut self) -> PResult<Vec<String>> {
        let mut items = Vec::new();
        if self.peek_is_lparen() {
            self.next()?;
            loop {
                match self.next()? {
                    Token::RParen => break,
                    Token::Atom(a) => items.push(a),
                    Token::Quoted(q) => items.push(q),
                    Token::Literal(l) => items.push(
                        String::from_utf8_lossy(&l).into_owned(),
                    ),
                    t => {
                        return Err(ParseError::new(format!(
                            "unexpected {:?} in list",
                            t
                        )))
                    }
                }
            }
        } else {
            items.push(self.astring()?);
        }
        Ok(items)
    }
}

// ==================== Command compiler ====================

/// Compile one command line. `literals` holds any literals the reader
/// framed, in order of appearance.
pub fn parse_command(
    line: &[u8],
    literals: Vec<Vec<u8>>,
) -> Result<CommandLine, (Option<String>, ParseError)> {
    let tokens = tokenize(line, literals.into())
        .map_err(|e| (None, e))?;
    let mut cursor = Cursor {
        tokens: tokens.into(),
    };

    let tag = match cursor.atom() {
        Ok(tag) if !tag.contains('+') => tag,
        _ => {
            return Err((
                None,
                ParseError::new("missing or malformed tag"),
            ))
        }
    };

    match parse_command_body(&mut cursor) {
        Ok(cmd) => {
            if cursor.at_end() {
                Ok(CommandLine { tag, cmd })
            } else {
                Err((
                    Some(tag),
                    ParseError::new("trailing arguments"),
                ))
            }
        }
        Err(e) => Err((Some(tag), e)),
    }
}

fn parse_command_body(c: &mut Cursor) -> PResult<Command> {
    let name = c.atom()?.to_ascii_uppercase();
    Ok(match name.as_str() {
        "CAPABILITY" => Command::Capability,
        "NOOP" => Command::Noop,
        "CHECK" => Command::Check,
        "LOGOUT" => Command::LogOut,
        "STARTTLS" => Command::StartTls,
        "IDLE" => Command::Idle,
        "NAMESPACE" => Command::Namespace,
        "CLOSE" => Command::Close,
        "UNSELECT" => Command::Unselect,
        "EXPUNGE" => Command::Expunge,

        "LOGIN" => Command::LogIn {
            userid: c.astring()?,
            password: c.astring()?,
        },

        "ID" => {
            let mut pairs = Vec::new();
            match c.next()? {
                Token::Atom(ref a) if a.eq_ignore_ascii_case("NIL") => {}
                Token::LParen => loop {
                    let key = match c.next()? {
                        Token::RParen => break,
                        Token::Atom(a) => a,
                        Token::Quoted(q) => q,
                        t => {
                            return Err(ParseError::new(format!(
                                "unexpected {:?} in ID",
                                t
                            )))
                        }
                    };
                    let value = match c.next()? {
                        Token::Atom(ref a)
                            if a.eq_ignore_ascii_case("NIL") =>
                        {
                            None
                        }
                        Token::Atom(a) => Some(a),
                        Token::Quoted(q) => Some(q),
                        t => {
                            return Err(ParseError::new(format!(
                                "unexpected {:?} in ID",
                                t
                            )))
                        }
                    };
                    pairs.push((key, value));
                },
                t => {
                    return Err(ParseError::new(format!(
                        "unexpected {:?} in ID",
                        t
                    )))
                }
            }
            Command::Id(pairs)
        }

        "ENABLE" => {
            let mut exts = Vec::new();
            while !c.at_end() {
                exts.push(c.atom()?);
            }
            Command::Enable(exts)
        }

        "LIST" => Command::List {
            reference: c.astring()?,
            pattern: c.astring()?,
        },
        "LSUB" => Command::Lsub {
            reference: c.astring()?,
            pattern: c.astring()?,
        },
        "SUBSCRIBE" => Command::Subscribe(c.astring()?),
        "UNSUBSCRIBE" => Command::Unsubscribe(c.astring()?),

        "CREATE" => {
            let name = c.astring()?;
            let mut special_use = Vec::new();
            // RFC 6154 CREATE-SPECIAL-USE: (USE (\Sent ...))
            if c.peek_is_lparen() {
                c.next()?;
                let kind = c.atom()?;
                if !kind.eq_ignore_ascii_case("USE") {
                    return Err(ParseError::new(
                        "unknown CREATE parameter",
                    ));
                }
                special_use = c.paren_list()?;
                match c.next()? {
                    Token::RParen => {}
                    t => {
                        return Err(ParseError::new(format!(
                            "expected ), got {:?}",
                            t
                        )))
                    }
                }
            }
            Command::Create { name, special_use }
        }
        "RENAME" => Command::Rename {
            from: c.astring()?,
            to: c.astring()?,
        },
        "DELETE" => Command::Delete(c.astring()?),

        "STATUS" => {
            let name = c.astring()?;
            c.expect_lparen()?;
            let mut items = Vec::new();
            loop {
                match c.next()? {
                    Token::RParen => break,
                    Token::Atom(a) => {
                        items.push(
                            match a.to_ascii_uppercase().as_str() {
                                "MESSAGES" => StatusItem::Messages,
                                "UIDNEXT" => StatusItem::UidNext,
                                "UIDVALIDITY" => {
                                    StatusItem::UidValidity
                                }
                                "UNSEEN" => StatusItem::Unseen,
                                "HIGHESTMODSEQ" => {
                                    StatusItem::HighestModseq
                                }
                                _ => {
                                    return Err(ParseError::new(
                                        format!(
                                            "unknown STATUS item {}",
                                            a
                                        ),
                                    ))
                                }
                            },
                        );
                    }
                    t => {
                        return Err(ParseError::new(format!(
                            "unexpected {:?} in STATUS",
                            t
                        )))
                    }
                }
            }
            Command::Status { name, items }
        }

        "SELECT" | "EXAMINE" => {
            let mailbox = c.astring()?;
            let mut condstore = false;
            if c.peek_is_lparen() {
                c.next()?;
                loop {
                    match c.next()? {
                        Token::RParen => break,
                        Token::Atom(ref a)
                            if a.eq_ignore_ascii_case("CONDSTORE") =>
                        {
                            condstore = true;
                        }
                        t => {
                            return Err(ParseError::new(format!(
                                "unknown select parameter {:?}",
                                t
                            )))
                        }
                    }
                }
            }
            if "SELECT" == name {
                Command::Select {
                    name: mailbox,
                    condstore,
                }
            } else {
                Command::Examine {
                    name: mailbox,
                    condstore,
                }
            }
        }

        "APPEND" => {
            let mailbox = c.astring()?;
            let mut flags = Vec::new();
            if c.peek_is_lparen() {
                for raw in c.paren_list()? {
                    flags.push(raw.parse().map_err(|_| {
                        ParseError::new(format!("bad flag {}", raw))
                    })?);
                }
            }
            let date = match c.tokens.front() {
                Some(Token::Quoted(_)) => {
                    let raw = c.astring()?;
                    Some(parse_datetime(&raw)?)
                }
                _ => None,
            };
            let message = c.literal()?;
            Command::Append {
                mailbox,
                flags,
                date,
                message,
            }
        }

        "COPY" => Command::Copy {
            messages: c.atom()?,
            mailbox: c.astring()?,
        },
        "MOVE" => Command::Move {
            messages: c.atom()?,
            mailbox: c.astring()?,
        },

        "STORE" => Command::Store(parse_store(c)?),
        "FETCH" => Command::Fetch(parse_fetch(c)?),
        "SEARCH" => Command::Search(parse_search(c)?),

        "GETQUOTAROOT" => Command::GetQuotaRoot(c.astring()?),
        "GETQUOTA" => Command::GetQuota(c.astring()?),

        "UID" => {
            let sub = c.atom()?.to_ascii_uppercase();
            Command::Uid(Box::new(match sub.as_str() {
                "COPY" => UidCommand::Copy {
                    messages: c.atom()?,
                    mailbox: c.astring()?,
                },
                "MOVE" => UidCommand::Move {
                    messages: c.atom()?,
                    mailbox: c.astring()?,
                },
                "EXPUNGE" => UidCommand::Expunge(c.atom()?),
                "STORE" => UidCommand::Store(parse_store(c)?),
                "FETCH" => UidCommand::Fetch(parse_fetch(c)?),
                "SEARCH" => UidCommand::Search(parse_search(c)?),
                _ => {
                    return Err(ParseError::new(format!(
                        "unknown UID command {}",
                        sub
                    )))
                }
            }))
        }

        _ => {
            return Err(ParseError::new(format!(
                "unrecognised command {}",
                name
            )))
        }
    })
}

fn parse_store(c: &mut Cursor) -> PResult<StoreCommand> {
    let messages = c.atom()?;

    let mut unchanged_since = None;
    if c.peek_is_lparen() {
        c.next()?;
        loop {
            match c.next()? {
                Token::RParen => break,
                Token::Atom(ref a)
                    if a.eq_ignore_ascii_case("UNCHANGEDSINCE") =>
                {
                    unchanged_since = Some(c.number()?);
                }
                t => {
                    return Err(ParseError::new(format!(
                        "unknown STORE modifier {:?}",
                        t
                    )))
                }
            }
        }
    }

    let action_atom = c.atom()?.to_ascii_uppercase();
    let (action_name, silent) = match action_atom.strip_suffix(".SILENT")
    {
        Some(prefix) => (prefix.to_owned(), true),
        None => (action_atom, false),
    };
    let action = match action_name.as_str() {
        "FLAGS" => StoreAction::Set,
        "+FLAGS" => StoreAction::Add,
        "-FLAGS" => StoreAction::Remove,
        _ => {
            return Err(ParseError::new(format!(
                "bad STORE action {}",
                action_name
            )))
        }
    };

    let mut flags = Vec::new();
    for raw in c.paren_list()? {
        flags.push(
            raw.parse().map_err(|_| {
                ParseError::new(format!("bad flag {}", raw))
            })?,
        );
    }

    Ok(StoreCommand {
        messages,
        action,
        silent,
        flags,
        unchanged_since,
    })
}

fn parse_fetch(c: &mut Cursor) -> PResult<FetchCommand> {
    let messages = c.atom()?;

    let mut items = Vec::new();
    let raw_items: Vec<String> = if c.peek_is_lparen() {
        let mut raw = Vec::new();
        c.next()?;
        loop {
            match c.next()? {
                Token::RParen => break,
                Token::Atom(a) => raw.push(a),
                t => {
                    return Err(ParseError::new(format!(
                        "unexpected {:?} in FETCH list",
                        t
                    )))
                }
            }
        }
        raw
    } else {
        vec![c.atom()?]
    };

    for raw in raw_items {
        let upper = raw.to_ascii_uppercase();
        match upper.as_str() {
            "ALL" => items.extend([
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
                FetchItem::Envelope,
            ]),
            "FAST" => items.extend([
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
            ]),
            "FULL" => items.extend([
                FetchItem::Flags,
                FetchItem::InternalDate,
                FetchItem::Rfc822Size,
                FetchItem::Envelope,
                FetchItem::Body,
            ]),
            "UID" => items.push(FetchItem::Uid),
            "FLAGS" => items.push(FetchItem::Flags),
            "INTERNALDATE" => items.push(FetchItem::InternalDate),
            "RFC822.SIZE" => items.push(FetchItem::Rfc822Size),
            "ENVELOPE" => items.push(FetchItem::Envelope),
            "BODY" => items.push(FetchItem::Body),
            "BODYSTRUCTURE" => items.push(FetchItem::BodyStructure),
            "MODSEQ" => items.push(FetchItem::Modseq),
            _ => items.push(parse_section_item(&raw)?),
        }
    }

    // CHANGEDSINCE modifier follows the item list.
    let mut changed_since = None;
    if c.peek_is_lparen() {
        c.next()?;
        loop {
            match c.next()? {
                Token::RParen => break,
                Token::Atom(ref a)
                    if a.eq_ignore_ascii_case("CHANGEDSINCE") =>
                {
                    changed_since = Some(c.number()?);
                }
                t => {
                    return Err(ParseError::new(format!(
                        "unknown FETCH modifier {:?}",
                        t
                    )))
                }
            }
        }
    }

    Ok(FetchCommand {
        messages,
        items,
        changed_since,
    })
}

/// Parse a `BODY[…]` / `BODY.PEEK[…]` item, with optional partial.
fn parse_section_item(raw: &str) -> PResult<FetchItem> {
    let upper = raw.to_ascii_uppercase();
    let peek = upper.starts_with("BODY.PEEK[");
    if !peek && !upper.starts_with("BODY[") {
        return Err(ParseError::new(format!(
            "unknown FETCH item {}",
            raw
        )));
    }

    let open = raw.find('[').unwrap();
    let close = raw
        .rfind(']')
        .ok_or_else(|| ParseError::new("unterminated section"))?;
    let inner = &raw[open + 1..close];

    let partial = match raw[close + 1..].trim() {
        "" => None,
        partial => {
            let partial = partial
                .strip_prefix('<')
                .and_then(|p| p.strip_suffix('>'))
                .ok_or_else(|| ParseError::new("bad partial"))?;
            let (offset, length) = partial
                .split_once('.')
                .ok_or_else(|| ParseError::new("bad partial"))?;
            Some((
                offset.parse().map_err(|_| {
                    ParseError::new("bad partial offset")
                })?,
                length.parse().map_err(|_| {
                    ParseError::new("bad partial length")
                })?,
            ))
        }
    };

    Ok(FetchItem::Section {
        section: parse_section(inner)?,
        peek,
        partial: partial.filter(|&(_, len)| len > 0),
    })
}

fn parse_section(inner: &str) -> PResult<Section> {
    let mut path = Vec::new();
    let mut rest = inner;

    loop {
        let (head, tail) = match rest.split_once('.') {
            Some((head, tail)) => (head, Some(tail)),
            None => (rest, None),
        };
        match head.parse::<u32>() {
            Ok(n) if n > 0 => {
                path.push(n);
                match tail {
                    Some(tail) => rest = tail,
                    None => {
                        return Ok(Section {
                            path,
                            leaf: SectionLeaf::Full,
                        })
                    }
                }
            }
            _ => break,
        }
    }

    if rest.is_empty() && path.is_empty() {
        return Ok(Section::full());
    }

    let upper = rest.to_ascii_uppercase();
    let leaf = if "HEADER" == upper {
        SectionLeaf::Header
    } else if "TEXT" == upper {
        SectionLeaf::Text
    } else if let Some(spec) = upper
        .strip_prefix("HEADER.FIELDS")
        .map(|s| s.trim_start())
    {
        let negate = spec.starts_with(".NOT")
            || upper.starts_with("HEADER.FIELDS.NOT");
        let fields_part = rest
            .find('(')
            .and_then(|open| {
                rest.rfind(')').map(|close| &rest[open + 1..close])
            })
            .ok_or_else(|| {
                ParseError::new("HEADER.FIELDS without field list")
            })?;
        SectionLeaf::HeaderFields {
            fields: fields_part
                .split_whitespace()
                .map(|f| f.trim_matches('"').to_ascii_lowercase())
                .collect(),
            negate,
        }
    } else if rest.is_empty() {
        SectionLeaf::Full
    } else {
        return Err(ParseError::new(format!(
            "unknown section {}",
            rest
        )));
    };

    Ok(Section { path, leaf })
}

fn parse_search(c: &mut Cursor) -> PResult<SearchCommand> {
    // Optional CHARSET; only ASCII-compatible charsets are accepted.
    if let Some(Token::Atom(a)) = c.tokens.front() {
        if a.eq_ignore_ascii_case("CHARSET") {
            c.next()?;
            let charset = c.astring()?;
            if !charset.eq_ignore_ascii_case("UTF-8")
                && !charset.eq_ignore_ascii_case("US-ASCII")
            {
                return Err(ParseError::new(format!(
                    "unsupported charset {}",
                    charset
                )));
            }
        }
    }

    let mut queries = Vec::new();
    while !c.at_end() {
        queries.push(parse_search_key(c)?);
    }
    if queries.is_empty() {
        return Err(ParseError::new("empty search key list"));
    }
    Ok(SearchCommand { queries })
}

fn parse_search_key(c: &mut Cursor) -> PResult<SearchQuery> {
    if c.peek_is_lparen() {
        c.next()?;
        let mut queries = Vec::new();
        while !matches!(c.tokens.front(), Some(Token::RParen)) {
            queries.push(parse_search_key(c)?);
        }
        c.next()?;
        return Ok(SearchQuery::And(queries));
    }

    let key = c.atom()?;
    let upper = key.to_ascii_uppercase();

    fn flag(flag: Flag, exists: bool) -> SearchQuery {
        SearchQuery::Flag { flag, exists }
    }

    fn header(name: &str, value: String) -> SearchQuery {
        SearchQuery::Header {
            name: name.to_owned(),
            value,
        }
    }

    Ok(match upper.as_str() {
        "ALL" => SearchQuery::All,
        "ANSWERED" => flag(Flag::Answered, true),
        "UNANSWERED" => flag(Flag::Answered, false),
        "DELETED" => flag(Flag::Deleted, true),
        "UNDELETED" => flag(Flag::Deleted, false),
        "DRAFT" => flag(Flag::Draft, true),
        "UNDRAFT" => flag(Flag::Draft, false),
        "FLAGGED" => flag(Flag::Flagged, true),
        "UNFLAGGED" => flag(Flag::Flagged, false),
        "SEEN" => flag(Flag::Seen, true),
        "UNSEEN" => flag(Flag::Seen, false),
        "KEYWORD" => flag(parse_flag(&c.atom()?)?, true),
        "UNKEYWORD" => flag(parse_flag(&c.atom()?)?, false),

        // \Recent is not tracked; nothing is recent, everything is old.
        "RECENT" | "NEW" => SearchQuery::UidSet(SeqRange::new()),
        "OLD" => SearchQuery::All,

        "NOT" => SearchQuery::Not(Box::new(parse_search_key(c)?)),
        "OR" => SearchQuery::Or(
            Box::new(parse_search_key(c)?),
            Box::new(parse_search_key(c)?),
        ),

        "TEXT" => SearchQuery::Text(c.astring()?),
        "BODY" => SearchQuery::Body(c.astring()?),
        "SUBJECT" => header("subject", c.astring()?),
        "FROM" => header("from", c.astring()?),
        "TO" => header("to", c.astring()?),
        "CC" => header("cc", c.astring()?),
        "BCC" => header("bcc", c.astring()?),
        "HEADER" => {
            let name = c.astring()?;
            header(&name.to_ascii_lowercase(), c.astring()?)
        }

        "UID" => {
            let raw = c.atom()?;
            SearchQuery::UidSet(
                SeqRange::parse(&raw, Uid::MAX).ok_or_else(|| {
                    ParseError::new(format!("bad UID set {}", raw))
                })?,
            )
        }

        "LARGER" => SearchQuery::Size {
            cmp: SizeComparison::Gt,
            size: c.number()? as u32,
        },
        "SMALLER" => SearchQuery::Size {
            cmp: SizeComparison::Lt,
            size: c.number()? as u32,
        },

        "MODSEQ" => SearchQuery::Modseq(c.number()?),

        "BEFORE" => internal_date(c, DateComparison::Lt)?,
        "ON" => internal_date(c, DateComparison::Day)?,
        "SINCE" => internal_date(c, DateComparison::Ge)?,
        "SENTBEFORE" => header_date(c, DateComparison::Lt)?,
        "SENTON" => header_date(c, DateComparison::Day)?,
        "SENTSINCE" => header_date(c, DateComparison::Ge)?,

        _ => {
            // A bare sequence set.
            SeqRange::parse(&key, Seqnum::MAX)
                .map(SearchQuery::SeqSet)
                .ok_or_else(|| {
                    ParseError::new(format!(
                        "unknown search key {}",
                        key
                    ))
                })?
        }
    })
}

fn parse_flag(raw: &str) -> PResult<Flag> {
    raw.parse()
        .map_err(|_| ParseError::new(format!("bad flag {}", raw)))
}

fn internal_date(
    c: &mut Cursor,
    cmp: DateComparison,
) -> PResult<SearchQuery> {
    Ok(SearchQuery::InternalDate {
        cmp,
        date: parse_date(&c.astring()?)?,
    })
}

fn header_date(
    c: &mut Cursor,
    cmp: DateComparison,
) -> PResult<SearchQuery> {
    Ok(SearchQuery::HeaderDate {
        cmp,
        date: parse_date(&c.astring()?)?,
    })
}

/// Parse the RFC 3501 `date` form, `5-Mar-2024` or `05-Mar-2024`.
pub fn parse_date(raw: &str) -> PResult<NaiveDate> {
    let raw = raw.trim();
    let padded;
    let raw = if raw.as_bytes().get(1) == Some(&b'-') {
        padded = format!("0{}", raw);
        &padded
    } else {
        raw
    };
    NaiveDate::parse_from_str(raw, "%d-%b-%Y")
        .map_err(|_| ParseError::new(format!("bad date {}", raw)))
}

/// Parse the RFC 3501 `date-time` form,
/// `" 5-Mar-2024 01:02:03 +0000"`.
pub fn parse_datetime(raw: &str) -> PResult<DateTime<Utc>> {
    let raw = raw.trim();
    let padded;
    let raw = if raw.as_bytes().get(1) == Some(&b'-') {
        padded = format!("0{}", raw);
        &padded
    } else {
        raw
    };
    DateTime::parse_from_str(raw, "%d-%b-%Y %H:%M:%S %z")
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| ParseError::new(format!("bad date-time {}", raw)))
}

// ==================== Response rendering ====================

/// Render a string as an IMAP quoted string, or a literal when it
/// contains octets a quoted string cannot carry.
pub fn astring(s: &str) -> String {
    if s.bytes().any(|b| b'\r' == b || b'\n' == b || !b.is_ascii()) {
        format!("{{{}}}\r\n{}", s.len(), s)
    } else {
        let mut out = String::with_capacity(s.len() + 2);
        out.push('"');
        for ch in s.chars() {
            if '"' == ch || '\\' == ch {
                out.push('\\');
            }
            out.push(ch);
        }
        out.push('"');
        out
    }
}

pub fn nstring(s: Option<&str>) -> String {
    match s {
        Some(s) => astring(s),
        None => "NIL".to_owned(),
    }
}

pub fn flag_list(flags: &[Flag]) -> String {
    let mut out = String::from("(");
    for (ix, flag) in flags.iter().enumerate() {
        if ix > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{}", flag);
    }
    out.push(')');
    out
}

/// Render an INTERNALDATE value.
pub fn date_time(date: &DateTime<Utc>) -> String {
    format!("\"{}\"", date.format("%d-%b-%Y %H:%M:%S +0000"))
}

fn address(addr: &Address) -> String {
    format!(
        "({} NIL {} {})",
        nstring(addr.name.as_deref()),
        nstring(addr.mailbox.as_deref()),
        nstring(addr.host.as_deref()),
    )
}

fn address_list(addrs: &[Address]) -> String {
    if addrs.is_empty() {
        return "NIL".to_owned();
    }
    let mut out = String::from("(");
    for addr in addrs {
        out.push_str(&address(addr));
    }
    out.push(')');
    out
}

pub fn envelope(env: &Envelope) -> String {
    format!(
        "({} {} {} {} {} {} {} {} {} {})",
        nstring(env.date.as_deref()),
        nstring(env.subject.as_deref()),
        address_list(&env.from),
        address_list(&env.sender),
        address_list(&env.reply_to),
        address_list(&env.to),
        address_list(&env.cc),
        address_list(&env.bcc),
        nstring(env.in_reply_to.as_deref()),
        nstring(env.message_id.as_deref()),
    )
}

fn param_list(params: &[(String, String)]) -> String {
    if params.is_empty() {
        return "NIL".to_owned();
    }
    let mut out = String::from("(");
    for (ix, (key, value)) in params.iter().enumerate() {
        if ix > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{} {}", astring(key), astring(value));
    }
    out.push(')');
    out
}

/// Render BODY (non-extended) or BODYSTRUCTURE (extended).
pub fn body_structure(bs: &BodyStructure, extended: bool) -> String {
    if bs.is_multipart() {
        let mut out = String::from("(");
        for child in &bs.children {
            out.push_str(&body_structure(child, extended));
        }
        let _ = write!(out, " {}", astring(&bs.media_subtype));
        if extended {
            let _ = write!(
                out,
                " {} {} NIL",
                param_list(&bs.params),
                disposition(&bs.disposition),
            );
        }
        out.push(')');
        return out;
    }

    let mut out = format!(
        "({} {} {} {} {} {} {}",
        astring(&bs.media_type),
        astring(&bs.media_subtype),
        param_list(&bs.params),
        nstring(bs.content_id.as_deref()),
        nstring(bs.description.as_deref()),
        astring(&bs.encoding),
        bs.size,
    );
    if let Some(lines) = bs.lines {
        let _ = write!(out, " {}", lines);
    }
    if extended {
        // MD5, disposition, language
        let _ = write!(out, " NIL {} NIL", disposition(&bs.disposition));
    }
    out.push(')');
    out
}

fn disposition(
    disposition: &Option<(String, Vec<(String, String)>)>,
) -> String {
    match disposition {
        None => "NIL".to_owned(),
        Some((kind, params)) => {
            format!("({} {})", astring(kind), param_list(params))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(line: &str) -> CommandLine {
        parse_command(line.as_bytes(), vec![]).unwrap()
    }

    fn parse_lit(line: &str, literals: Vec<&[u8]>) -> CommandLine {
        parse_command(
            line.as_bytes(),
            literals.into_iter().map(|l| l.to_vec()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn parses_simple_commands() {
        assert_eq!(
            CommandLine {
                tag: "a1".to_owned(),
                cmd: Command::Capability,
            },
            parse("a1 CAPABILITY"),
        );
        assert_eq!(Command::Noop, parse("2 noop").cmd);
        assert_eq!(Command::LogOut, parse("3 LOGOUT").cmd);
    }

    #[test]
    fn parses_login_with_quoted_and_literal() {
        assert_eq!(
            Command::LogIn {
                userid: "azure".to_owned(),
                password: "hunter\"2".to_owned(),
            },
            parse(r#"a LOGIN azure "hunter\"2""#).cmd,
        );

        assert_eq!(
            Command::LogIn {
                userid: "azure".to_owned(),
                password: "secret".to_owned(),
            },
            parse_lit("a LOGIN azure {6}", vec![b"secret".as_slice()]).cmd,
        );
    }

    #[test]
    fn parses_select_with_condstore() {
        assert_eq!(
            Command::Select {
                name: "INBOX".to_owned(),
                condstore: true,
            },
            parse("a SELECT INBOX (CONDSTORE)").cmd,
        );
    }

    #[test]
    fn parses_append() {
        let cmd = parse_lit(
            "a APPEND saved (\\Seen) \"05-Mar-2024 10:00:00 +0000\" {4}",
            vec![b"body".as_slice()],
        )
        .cmd;
        let Command::Append {
            mailbox,
            flags,
            date,
            message,
        } = cmd
        else {
            panic!("not an append");
        };
        assert_eq!("saved", mailbox);
        assert_eq!(vec![Flag::Seen], flags);
        assert_eq!(
            Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap(),
            date.unwrap(),
        );
        assert_eq!(b"body".to_vec(), message);
    }

    #[test]
    fn parses_store_with_unchangedsince() {
        let Command::Uid(uid) = parse(
            "a UID STORE 1:3 (UNCHANGEDSINCE 42) +FLAGS.SILENT (\\Deleted)",
        )
        .cmd
        else {
            panic!("not a UID command");
        };
        assert_eq!(
            UidCommand::Store(StoreCommand {
                messages: "1:3".to_owned(),
                action: StoreAction::Add,
                silent: true,
                flags: vec![Flag::Deleted],
                unchanged_since: Some(42),
            }),
            *uid,
        );
    }

    #[test]
    fn parses_fetch_with_section_and_modifier() {
        let Command::Fetch(fetch) = parse(
            "a FETCH 1 (UID BODY.PEEK[HEADER.FIELDS (DATE FROM)]<0.128>) \
             (CHANGEDSINCE 7)",
        )
        .cmd
        else {
            panic!("not a fetch");
        };

        assert_eq!("1", fetch.messages);
        assert_eq!(Some(7), fetch.changed_since);
        assert_eq!(FetchItem::Uid, fetch.items[0]);
        assert_eq!(
            FetchItem::Section {
                section: Section {
                    path: vec![],
                    leaf: SectionLeaf::HeaderFields {
                        fields: vec![
                            "date".to_owned(),
                            "from".to_owned(),
                        ],
                        negate: false,
                    },
                },
                peek: true,
                partial: Some((0, 128)),
            },
            fetch.items[1],
        );
    }

    #[test]
    fn parses_numeric_section_paths() {
        let Command::Fetch(fetch) = parse("a FETCH 1 BODY[1.2]").cmd
        else {
            panic!("not a fetch");
        };
        assert_eq!(
            FetchItem::Section {
                section: Section {
                    path: vec![1, 2],
                    leaf: SectionLeaf::Full,
                },
                peek: false,
                partial: None,
            },
            fetch.items[0],
        );
    }

    #[test]
    fn parses_search() {
        let Command::Search(search) =
            parse("a SEARCH UNSEEN OR FROM alice LARGER 1024 NOT TEXT foo")
                .cmd
        else {
            panic!("not a search");
        };
        assert_eq!(4, search.queries.len());
        assert!(matches!(
            search.queries[0],
            SearchQuery::Flag {
                flag: Flag::Seen,
                exists: false,
            },
        ));
        assert!(matches!(search.queries[1], SearchQuery::Or(..)));
        assert!(matches!(search.queries[3], SearchQuery::Not(..)));
    }

    #[test]
    fn bad_commands_are_rejected_with_the_tag() {
        let (tag, _) =
            parse_command(b"a5 FROBNICATE", vec![]).unwrap_err();
        assert_eq!(Some("a5".to_owned()), tag);

        let (tag, _) = parse_command(b"", vec![]).unwrap_err();
        assert_eq!(None, tag);
    }

    #[test]
    fn astring_quotes_and_falls_back_to_literal() {
        assert_eq!("\"hello\"", astring("hello"));
        assert_eq!(r#""say \"hi\"""#, astring("say \"hi\""));
        assert_eq!("{5}\r\na\r\nb", astring("a\r\nb"));
        assert_eq!("{5}\r\ncaf\u{e9}", astring("caf\u{e9}"));
    }

    #[test]
    fn renders_envelope() {
        let env = Envelope {
            date: Some("Tue, 5 Mar 2024 10:00:00 +0000".to_owned()),
            subject: Some("hi".to_owned()),
            from: vec![Address {
                name: Some("Alice".to_owned()),
                mailbox: Some("alice".to_owned()),
                host: Some("example.com".to_owned()),
            }],
            sender: vec![],
            reply_to: vec![],
            to: vec![],
            cc: vec![],
            bcc: vec![],
            in_reply_to: None,
            message_id: Some("<m@x>".to_owned()),
        };
        assert_eq!(
            "(\"Tue, 5 Mar 2024 10:00:00 +0000\" \"hi\" \
             ((\"Alice\" NIL \"alice\" \"example.com\")) \
             NIL NIL NIL NIL NIL NIL \"<m@x>\")",
            envelope(&env),
        );
    }

    #[test]
    fn renders_body_structure() {
        let bs = BodyStructure {
            media_type: "text".to_owned(),
            media_subtype: "plain".to_owned(),
            params: vec![(
                "charset".to_owned(),
                "utf-8".to_owned(),
            )],
            content_id: None,
            description: None,
            encoding: "7bit".to_owned(),
            size: 11,
            lines: Some(1),
            children: vec![],
            disposition: None,
        };
        assert_eq!(
            "(\"text\" \"plain\" (\"charset\" \"utf-8\") NIL NIL \
             \"7bit\" 11 1)",
            body_structure(&bs, false),
        );

        let multi = BodyStructure {
            media_type: "multipart".to_owned(),
            media_subtype: "mixed".to_owned(),
            children: vec![bs.clone(), bs],
            ..BodyStructure::default()
        };
        let rendered = body_structure(&multi, false);
        assert!(rendered.starts_with("((\"text\""));
        assert!(rendered.ends_with(" \"mixed\")"));
    }
}
