//-
// Copyright (c) 2023, 2024, the Wingmap authors
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

use std::convert::{TryFrom, TryInto};
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroU32;
use std::str::FromStr;

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// Uniquely identifies a message within a single mailbox.
///
/// UIDs start at 1 and increase monotonically as messages are added to the
/// mailbox. UIDs are never reused; the allocator is the `uid_next` counter
/// on the mailbox document, which only ever moves forward.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Uid(pub NonZeroU32);

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

// This isn't a useful default implementation, but is here so that things
// containing SeqRange<ID> can still derive Default.
impl Default for Uid {
    fn default() -> Self {
        Uid::MIN
    }
}

impl Uid {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Uid(NonZeroU32::new_unchecked(1)) };
    pub const MAX: Self = unsafe { Uid(NonZeroU32::new_unchecked(u32::MAX)) };

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid)
    }

    pub fn next(self) -> Option<Self> {
        if Uid::MAX == self {
            None
        } else {
            Some(Uid(NonZeroU32::new(self.0.get() + 1).unwrap()))
        }
    }

    pub fn saturating_next(self) -> Self {
        self.next().unwrap_or(Uid::MAX)
    }

    #[cfg(test)]
    pub fn u(uid: u32) -> Self {
        Uid::of(uid).unwrap()
    }
}

impl TryFrom<u32> for Uid {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Uid> for u32 {
    fn from(uid: Uid) -> u32 {
        uid.0.get()
    }
}

/// The sequence number of a message: one plus the number of messages with a
/// smaller UID in the session's current snapshot.
///
/// Sequence numbers shift whenever an `EXPUNGE` is reported to the client,
/// so they are only meaningful relative to one session's view at one
/// protocol moment. Everything durable is keyed by UID; sequence numbers
/// are manufactured at the edge.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Seqnum(pub NonZeroU32);

// This isn't a useful default implementation, but is here so that things
// containing SeqRange<ID> can still derive Default.
impl Default for Seqnum {
    fn default() -> Self {
        Seqnum::MIN
    }
}

impl Seqnum {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Seqnum(NonZeroU32::new_unchecked(1)) };
    pub const MAX: Self =
        unsafe { Seqnum(NonZeroU32::new_unchecked(u32::MAX)) };

    pub fn of(seqnum: u32) -> Option<Self> {
        NonZeroU32::new(seqnum).map(Seqnum)
    }

    #[cfg(test)]
    pub fn u(seqnum: u32) -> Self {
        Seqnum::of(seqnum).unwrap()
    }

    pub fn to_index(self) -> usize {
        let u: Result<usize, _> = self.0.get().try_into();
        u.unwrap() - 1
    }

    pub fn from_index(ix: usize) -> Self {
        Seqnum::of((ix + 1).try_into().unwrap()).unwrap()
    }
}

impl TryFrom<u32> for Seqnum {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Seqnum> for u32 {
    fn from(seqnum: Seqnum) -> u32 {
        seqnum.0.get()
    }
}

impl fmt::Debug for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Seqnum({})", self.0.get())
    }
}

/// A CONDSTORE/QRESYNC "modifier sequence" number.
///
/// Modseqs are allocated by atomically incrementing the owning mailbox's
/// `modify_index`, so they are strictly ordered per mailbox. A brand new
/// mailbox has `modify_index` 0; since RFC 7162 does not permit sending 0
/// on the wire, `wire_value` floors the reported value at 1.
#[derive(
    Deserialize,
    Serialize,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[serde(transparent)]
pub struct Modseq(pub u64);

impl Modseq {
    pub const ZERO: Self = Modseq(0);

    pub fn of(raw: u64) -> Self {
        Modseq(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn wire_value(self) -> u64 {
        self.0.max(1)
    }
}

impl fmt::Debug for Modseq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Modseq({})", self.0)
    }
}

/// A set of message sequence numbers or UIDs, as described by the IMAP
/// `sequence-set` grammar.
///
/// The set is kept as sorted, pairwise-disjoint, non-adjacent inclusive
/// runs, which makes `Display` produce the minimal wire form for free.
/// Input order, duplication, and fragmentation are not preserved, and
/// nothing can be removed once added.
///
/// IMAP has no way to write an empty sequence set; `Display` of an empty
/// set yields an empty string, which callers must not put on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct SeqRange<T> {
    runs: Vec<(u32, u32)>,
    _marker: PhantomData<T>,
}

impl<T> SeqRange<T> {
    /// Create a new, empty set.
    pub fn new() -> Self {
        SeqRange {
            runs: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Whether the set is empty (unrepresentable in wire format).
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// The inclusive runs of the set, ascending.
    pub fn ranges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.runs.iter().copied()
    }

    /// The number of members.
    pub fn len(&self) -> usize {
        self.runs.iter().map(|&(lo, hi)| (hi - lo + 1) as usize).sum()
    }

    /// The largest member, raw.
    pub fn max(&self) -> Option<u32> {
        self.runs.last().map(|&(_, hi)| hi)
    }

    /// Fold the run `[lo, hi]` into the set, coalescing everything it
    /// overlaps or abuts.
    fn add_run(&mut self, mut lo: u32, mut hi: u32) {
        debug_assert!(0 < lo && lo <= hi);

        // The first existing run that could merge with the new one is
        // the first whose end reaches at least lo - 1.
        let first = self
            .runs
            .partition_point(|&(_, end)| end.saturating_add(1) < lo);
        let mut last = first;
        while last < self.runs.len()
            && self.runs[last].0 <= hi.saturating_add(1)
        {
            lo = lo.min(self.runs[last].0);
            hi = hi.max(self.runs[last].1);
            last += 1;
        }

        self.runs.splice(first..last, std::iter::once((lo, hi)));
    }

    fn contains_raw(&self, v: u32) -> bool {
        match self.runs.partition_point(|&(lo, _)| lo <= v) {
            0 => false,
            n => self.runs[n - 1].1 >= v,
        }
    }
}

impl<T: TryFrom<u32> + Into<u32>> SeqRange<T> {
    /// Create a set containing just the given item.
    pub fn just(item: T) -> Self {
        let mut this = SeqRange::new();
        this.append(item);
        this
    }

    /// Create a set containing a single run.
    pub fn range(start: T, end: T) -> Self {
        let mut this = SeqRange::new();
        this.insert(start, end);
        this
    }

    /// Append one item, which must be strictly greater than every item
    /// already present. This is the cheap path for callers that produce
    /// members in ascending order (UID lists, cursor results).
    pub fn append(&mut self, item: T) {
        let v: u32 = item.into();
        if let Some((_, end)) = self.runs.last_mut() {
            assert!(v > *end, "append out of order");
            if v == *end + 1 {
                *end = v;
                return;
            }
        }
        self.runs.push((v, v));
    }

    /// Insert an inclusive run, given in the correct order.
    pub fn insert(&mut self, start: T, end: T) {
        let (start, end): (u32, u32) = (start.into(), end.into());
        assert!(start <= end);
        self.add_run(start, end);
    }

    /// Whether the given item is a member.
    pub fn contains(&self, item: T) -> bool {
        self.contains_raw(item.into())
    }

    /// Iterate the members in ascending order. Members above `max`, and
    /// raw values `T` cannot represent, are skipped.
    pub fn items<'a>(
        &'a self,
        max: impl Into<u32>,
    ) -> impl Iterator<Item = T> + 'a {
        let max: u32 = max.into();
        self.runs
            .iter()
            .take_while(move |&&(lo, _)| lo <= max)
            .flat_map(move |&(lo, hi)| lo..=hi.min(max))
            .filter_map(|v| T::try_from(v).ok())
    }

    /// Parse the wire form of a sequence set. `splat` substitutes for
    /// `*`.
    pub fn parse(raw: &str, splat: T) -> Option<Self> {
        let splat: u32 = splat.into();
        let endpoint = |s: &str| -> Option<u32> {
            if "*" == s {
                Some(splat)
            } else {
                s.parse().ok().filter(|&v| v > 0)
            }
        };

        let mut this = Self::new();
        for part in raw.split(',') {
            let (lo, hi) = match part.split_once(':') {
                None => {
                    let v = endpoint(part)?;
                    (v, v)
                }
                Some((a, b)) => {
                    if b.contains(':') {
                        return None;
                    }
                    let a = endpoint(a)?;
                    let b = endpoint(b)?;
                    // RFC 3501 permits the endpoints in either order.
                    (a.min(b), a.max(b))
                }
            };
            this.add_run(lo, hi);
        }

        Some(this)
    }
}

impl<T> fmt::Display for SeqRange<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (ix, &(lo, hi)) in self.runs.iter().enumerate() {
            if ix > 0 {
                f.write_str(",")?;
            }
            if lo == hi {
                write!(f, "{}", lo)?;
            } else {
                write!(f, "{}:{}", lo, hi)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SeqRange<Seqnum> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SeqRange<Seqnum>({})", self)
    }
}

impl fmt::Debug for SeqRange<Uid> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SeqRange<Uid>({})", self)
    }
}

impl<T> Default for SeqRange<T> {
    fn default() -> Self {
        SeqRange::new()
    }
}

/// A message flag.
///
/// System flags are represented as top-level enum values. Keywords are in
/// the `Keyword` case, with their original casing preserved.
///
/// The `Display` format of this type is the exact string value that would
/// be sent over the wire. `FromStr` does the reverse conversion, and also
/// understands non-standard casing of the system flags.
#[derive(Clone, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
    Keyword(String),
}

impl Flag {
    pub fn is_keyword(&self) -> bool {
        matches!(*self, Flag::Keyword(..))
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Keyword(ref kw) => write!(f, "{}", kw),
        }
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Flag as fmt::Display>::fmt(self, f)
    }
}

impl From<Flag> for String {
    fn from(flag: Flag) -> String {
        flag.to_string()
    }
}

impl TryFrom<String> for Flag {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\answered") {
            Ok(Flag::Answered)
        } else if s.eq_ignore_ascii_case("\\deleted") {
            Ok(Flag::Deleted)
        } else if s.eq_ignore_ascii_case("\\draft") {
            Ok(Flag::Draft)
        } else if s.eq_ignore_ascii_case("\\flagged") {
            Ok(Flag::Flagged)
        } else if s.eq_ignore_ascii_case("\\seen") {
            Ok(Flag::Seen)
        } else if s.starts_with('\\') {
            Err(Error::NxFlag)
        } else if !s.is_empty()
            && s.as_bytes().iter().copied().all(is_atom_char)
        {
            Ok(Flag::Keyword(s.to_owned()))
        } else {
            Err(Error::UnsafeName)
        }
    }
}

fn is_atom_char(ch: u8) -> bool {
    match ch {
        0..=b' ' => false,
        127..=255 => false,
        b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']' => false,
        _ => true,
    }
}

impl PartialEq for Flag {
    fn eq(&self, other: &Flag) -> bool {
        match (self, other) {
            (&Flag::Answered, &Flag::Answered) => true,
            (&Flag::Deleted, &Flag::Deleted) => true,
            (&Flag::Draft, &Flag::Draft) => true,
            (&Flag::Flagged, &Flag::Flagged) => true,
            (&Flag::Seen, &Flag::Seen) => true,
            // Keywords are matched ASCII case-insensitively (the
            // conventional interpretation of RFC 3501), but stored with the
            // casing of their first appearance.
            (&Flag::Keyword(ref a), &Flag::Keyword(ref b)) => {
                a.eq_ignore_ascii_case(b)
            }
            _ => false,
        }
    }
}

impl Eq for Flag {}

/// An RFC 6154 special-use role attached to a mailbox.
///
/// A mailbox carrying one of these refuses `DELETE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpecialUse {
    #[serde(rename = "\\Archive")]
    Archive,
    #[serde(rename = "\\Drafts")]
    Drafts,
    #[serde(rename = "\\Junk")]
    Junk,
    #[serde(rename = "\\Sent")]
    Sent,
    #[serde(rename = "\\Trash")]
    Trash,
}

impl SpecialUse {
    pub fn name(self) -> &'static str {
        match self {
            SpecialUse::Archive => "\\Archive",
            SpecialUse::Drafts => "\\Drafts",
            SpecialUse::Junk => "\\Junk",
            SpecialUse::Sent => "\\Sent",
            SpecialUse::Trash => "\\Trash",
        }
    }
}

impl FromStr for SpecialUse {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\archive") {
            Ok(SpecialUse::Archive)
        } else if s.eq_ignore_ascii_case("\\drafts") {
            Ok(SpecialUse::Drafts)
        } else if s.eq_ignore_ascii_case("\\junk") {
            Ok(SpecialUse::Junk)
        } else if s.eq_ignore_ascii_case("\\sent") {
            Ok(SpecialUse::Sent)
        } else if s.eq_ignore_ascii_case("\\trash") {
            Ok(SpecialUse::Trash)
        } else {
            Err(Error::UnsafeName)
        }
    }
}

impl fmt::Display for SpecialUse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Attributes reported on `LIST`/`LSUB` lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MailboxAttribute {
    Noselect,
    HasChildren,
    HasNoChildren,
    Subscribed,
    Archive,
    Drafts,
    Junk,
    Sent,
    Trash,
}

impl MailboxAttribute {
    pub fn name(self) -> &'static str {
        match self {
            MailboxAttribute::Noselect => "\\Noselect",
            MailboxAttribute::HasChildren => "\\HasChildren",
            MailboxAttribute::HasNoChildren => "\\HasNoChildren",
            MailboxAttribute::Subscribed => "\\Subscribed",
            MailboxAttribute::Archive => "\\Archive",
            MailboxAttribute::Drafts => "\\Drafts",
            MailboxAttribute::Junk => "\\Junk",
            MailboxAttribute::Sent => "\\Sent",
            MailboxAttribute::Trash => "\\Trash",
        }
    }
}

impl From<SpecialUse> for MailboxAttribute {
    fn from(role: SpecialUse) -> Self {
        match role {
            SpecialUse::Archive => MailboxAttribute::Archive,
            SpecialUse::Drafts => MailboxAttribute::Drafts,
            SpecialUse::Junk => MailboxAttribute::Junk,
            SpecialUse::Sent => MailboxAttribute::Sent,
            SpecialUse::Trash => MailboxAttribute::Trash,
        }
    }
}

impl fmt::Display for MailboxAttribute {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Apply a `STORE` action to `current`, returning the new flag set and
/// whether it differs from the old one.
///
/// Membership is case-insensitive (see `Flag::eq`); casing of stored
/// keywords is preserved.
pub fn apply_store_action(
    current: &[Flag],
    listed: &[Flag],
    action: StoreAction,
) -> (Vec<Flag>, bool) {
    let mut next: Vec<Flag> = match action {
        StoreAction::Set => Vec::new(),
        StoreAction::Add | StoreAction::Remove => current.to_vec(),
    };

    match action {
        // The client can list a flag twice, so both constructive actions
        // insert one at a time.
        StoreAction::Set | StoreAction::Add => {
            for flag in listed {
                if !next.contains(flag) {
                    next.push(flag.clone());
                }
            }
        }
        StoreAction::Remove => {
            next.retain(|f| !listed.contains(f));
        }
    }

    let changed = next.len() != current.len()
        || next.iter().any(|f| !current.contains(f))
        || current.iter().any(|f| !next.contains(f));
    (next, changed)
}

/// The three denormalized booleans maintained on every message document.
///
/// These must equal membership of `\Seen`/`\Flagged`/`\Deleted` in the flag
/// set at all times; they exist so that the common search and status
/// queries hit narrow indexes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DenormalizedFlags {
    pub seen: bool,
    pub flagged: bool,
    pub deleted: bool,
}

impl DenormalizedFlags {
    pub fn of(flags: &[Flag]) -> Self {
        Self {
            seen: flags.contains(&Flag::Seen),
            flagged: flags.contains(&Flag::Flagged),
            deleted: flags.contains(&Flag::Deleted),
        }
    }
}

/// Which way a `STORE` manipulates the listed flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreAction {
    /// `FLAGS`: the listed flags replace the message's flags.
    Set,
    /// `+FLAGS`: the listed flags are added.
    Add,
    /// `-FLAGS`: the listed flags are removed.
    Remove,
}

/// The response for the `APPEND` command.
///
/// Both fields feed the RFC 4315 `APPENDUID` response code.
#[derive(Debug, Clone)]
pub struct AppendResponse {
    /// The UID validity value of the destination mailbox.
    pub uid_validity: u32,
    /// The UID of the inserted message.
    pub uid: Uid,
}

/// The response from `COPY`/`UID COPY`/`MOVE`/`UID MOVE`.
#[derive(Debug, Clone, Default)]
pub struct CopyResponse {
    /// The UID validity value of the destination mailbox.
    pub uid_validity: u32,
    /// The UID(s) of the source messages that were copied.
    pub from_uids: SeqRange<Uid>,
    /// The UID(s) of the new messages, parallel to `from_uids`.
    pub to_uids: SeqRange<Uid>,
}

/// A date comparison operator in a `SEARCH` criterion.
///
/// `Day` is the operator-less form: the inclusive day-long range starting
/// at the given date's midnight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DateComparison {
    Day,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A numeric comparison operator in a `SEARCH SIZE` criterion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeComparison {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

/// The query for the `SEARCH` command.
///
/// This is a direct representation of the parsed IMAP search criteria; the
/// search compiler translates it into a storage query plus a residual
/// in-process filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchQuery {
    All,
    SeqSet(SeqRange<Seqnum>),
    UidSet(SeqRange<Uid>),
    /// A flag criterion: `exists` is false for the `Un$flag` forms.
    Flag {
        flag: Flag,
        exists: bool,
    },
    Header {
        name: String,
        value: String,
    },
    Text(String),
    Body(String),
    Modseq(u64),
    InternalDate {
        cmp: DateComparison,
        date: NaiveDate,
    },
    HeaderDate {
        cmp: DateComparison,
        date: NaiveDate,
    },
    Size {
        cmp: SizeComparison,
        size: u32,
    },
    Not(Box<SearchQuery>),
    Or(Box<SearchQuery>, Box<SearchQuery>),
    And(Vec<SearchQuery>),
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn uids(raw: &str) -> SeqRange<Uid> {
        SeqRange::parse(raw, Uid::u(100)).unwrap()
    }

    #[test]
    fn wire_form_is_minimal() {
        assert_eq!("3", uids("3").to_string());
        assert_eq!("2:6", uids("2:6").to_string());
        // Overlap, adjacency, and containment all collapse.
        assert_eq!("1:5", uids("2:4,1,5").to_string());
        assert_eq!("1:6", uids("1:3,4:6").to_string());
        assert_eq!("1:10", uids("1:10,3:4").to_string());
        // Disjoint runs come out sorted no matter the input order.
        assert_eq!("1:3,7,9:10", uids("9,1:3,10,7").to_string());
    }

    #[test]
    fn splat_takes_the_caller_value() {
        let starred = uids("*");
        assert_eq!(
            vec![100u32],
            starred.items(u32::MAX).map(u32::from).collect::<Vec<_>>(),
        );
        assert_eq!("99:100", uids("*:99").to_string());
    }

    #[test]
    fn reversed_endpoints_are_reordered() {
        assert_eq!("2:6", uids("6:2").to_string());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(None, SeqRange::parse("", Uid::u(5)));
        assert_eq!(None, SeqRange::parse("0", Uid::u(5)));
        assert_eq!(None, SeqRange::parse("1:2:3", Uid::u(5)));
        assert_eq!(None, SeqRange::parse("1,,2", Uid::u(5)));
        assert_eq!(None, SeqRange::parse("seven", Uid::u(5)));
    }

    #[test]
    fn append_grows_the_tail_run() {
        let mut set = SeqRange::new();
        for uid in [1u32, 2, 4, 5, 9] {
            set.append(Uid::u(uid));
        }
        assert_eq!("1:2,4:5,9", set.to_string());
    }

    #[test]
    fn membership_len_and_max() {
        let set = uids("2:4,8");
        assert!(!set.contains(Uid::u(1)));
        assert!(set.contains(Uid::u(2)));
        assert!(set.contains(Uid::u(3)));
        assert!(set.contains(Uid::u(4)));
        assert!(!set.contains(Uid::u(5)));
        assert!(set.contains(Uid::u(8)));
        assert!(!set.contains(Uid::u(9)));
        assert_eq!(4, set.len());
        assert_eq!(Some(8), set.max());
        assert!(!set.is_empty());
        assert!(SeqRange::<Uid>::new().is_empty());
    }

    #[test]
    fn items_clamp_to_the_given_maximum() {
        let set = uids("1:3,90:95");
        let listed: Vec<u32> =
            set.items(Uid::u(91)).map(u32::from).collect();
        assert_eq!(vec![1, 2, 3, 90, 91], listed);
    }

    proptest! {
        #[test]
        fn runs_model_a_plain_set(
            parts in prop::collection::vec((1u32..60, 0u32..8), 0..12),
            probe in 1u32..70,
        ) {
            let mut set = SeqRange::<Uid>::new();
            let mut model = std::collections::BTreeSet::new();
            for &(lo, extent) in &parts {
                set.insert(Uid::u(lo), Uid::u(lo + extent));
                model.extend(lo..=lo + extent);
            }

            // Runs stay sorted, disjoint, and non-adjacent, which is
            // what makes the wire form minimal.
            let runs: Vec<(u32, u32)> = set.ranges().collect();
            for pair in runs.windows(2) {
                prop_assert!(pair[0].1 + 1 < pair[1].0);
            }

            let listed: Vec<u32> =
                set.items(u32::MAX).map(u32::from).collect();
            prop_assert_eq!(
                model.iter().copied().collect::<Vec<_>>(),
                listed,
            );
            prop_assert_eq!(model.contains(&probe), set.contains(Uid::u(probe)));
            prop_assert_eq!(model.len(), set.len());

            // The wire form round-trips.
            if !set.is_empty() {
                prop_assert_eq!(
                    set.clone(),
                    SeqRange::parse(&set.to_string(), Uid::MAX).unwrap(),
                );
            }
        }
    }

    fn kw(s: &str) -> Flag {
        Flag::Keyword(s.to_owned())
    }

    #[test]
    fn flag_parsing_and_case() {
        assert_eq!(Flag::Seen, "\\SEEN".parse().unwrap());
        assert_eq!(Flag::Deleted, "\\deleted".parse().unwrap());
        assert_eq!(kw("Forwarded"), "forwarded".parse().unwrap());
        assert_matches!(Err(Error::NxFlag), "\\Recent".parse::<Flag>());
        assert_matches!(Err(Error::UnsafeName), "a flag".parse::<Flag>());
        assert_matches!(Err(Error::UnsafeName), "".parse::<Flag>());
    }

    #[test]
    fn store_action_set_replaces() {
        let current = vec![Flag::Seen, kw("Old")];
        let (next, changed) = apply_store_action(
            &current,
            &[Flag::Flagged, Flag::Flagged],
            StoreAction::Set,
        );
        assert_eq!(vec![Flag::Flagged], next);
        assert!(changed);
    }

    #[test]
    fn store_action_add_preserves_existing_casing() {
        let current = vec![kw("Forwarded")];
        let (next, changed) = apply_store_action(
            &current,
            &[kw("FORWARDED"), Flag::Seen],
            StoreAction::Add,
        );
        // Membership check is case-insensitive; the original casing wins.
        assert_eq!(vec![kw("Forwarded"), Flag::Seen], next);
        assert_eq!("Forwarded", next[0].to_string());
        assert!(changed);
    }

    #[test]
    fn store_action_add_noop_detected() {
        let current = vec![Flag::Seen];
        let (next, changed) =
            apply_store_action(&current, &[Flag::Seen], StoreAction::Add);
        assert_eq!(current, next);
        assert!(!changed);
    }

    #[test]
    fn store_action_remove() {
        let current = vec![Flag::Seen, Flag::Deleted, kw("Junk")];
        let (next, changed) = apply_store_action(
            &current,
            &[Flag::Deleted, kw("JUNK")],
            StoreAction::Remove,
        );
        assert_eq!(vec![Flag::Seen], next);
        assert!(changed);

        let (_, changed) = apply_store_action(
            &[Flag::Seen],
            &[Flag::Deleted],
            StoreAction::Remove,
        );
        assert!(!changed);
    }

    #[test]
    fn denormalized_flags_track_membership() {
        assert_eq!(
            DenormalizedFlags {
                seen: true,
                flagged: false,
                deleted: true,
            },
            DenormalizedFlags::of(&[Flag::Seen, Flag::Deleted, kw("x")]),
        );
        assert_eq!(
            DenormalizedFlags::default(),
            DenormalizedFlags::of(&[kw("x")]),
        );
    }
}
