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

//! Translates IMAP SEARCH criteria into a storage query plus a residual
//! in-process filter.
//!
//! Most criteria push straight down to the document store. Two things
//! cannot: negated full-text terms (the index cannot prove absence), and
//! HEADER value matching, whose comparison is defined over MIME-decoded,
//! case-folded text the store never sees. Header criteria compile to a
//! cheap key-presence clause for pruning plus a residual predicate
//! evaluated against each candidate row.
//!
//! Every term compiles to a small algebra (`Term`) so that emptiness is
//! a consequence of the tree's boolean structure rather than a global
//! flag: an unanswerable term poisons any conjunction that needs it, but
//! inside a disjunction it merely contributes nothing and the other
//! branch still runs. Only when the whole tree reduces to empty or
//! unanswerable does the compiled search short-circuit via `nothing`.

use chrono::prelude::*;
use mongodb::bson::{doc, Bson, Document};
use regex::Regex;

use crate::account::model::{
    DateComparison, Flag, SearchQuery, SeqRange, SizeComparison, Uid,
};
use crate::mime::{self, HeaderPair};
use crate::storage::{uid_set_filter, MailboxId};
use crate::support::error::Error;

/// The compiled form of one SEARCH invocation.
#[derive(Debug)]
pub struct CompiledSearch {
    /// The filter to hand to the document store, including the mailbox
    /// constraint.
    pub filter: Document,
    /// Predicates the store cannot evaluate; a row must pass all of them.
    pub residual: Vec<Residual>,
    /// Fast path: the result is known to be empty without touching the
    /// store at all.
    pub nothing: bool,
}

/// An in-process predicate over a candidate message.
#[derive(Debug)]
pub enum Residual {
    /// HEADER value match over the MIME-decoded header text.
    Header {
        name: String,
        pattern: Regex,
        negated: bool,
    },
}

impl Residual {
    pub fn matches(&self, headers: &[HeaderPair]) -> bool {
        match *self {
            Residual::Header {
                ref name,
                ref pattern,
                negated,
            } => {
                let hit = headers
                    .iter()
                    .filter(|h| h.key == *name)
                    .any(|h| {
                        pattern.is_match(&mime::decode_encoded_words(
                            &h.value,
                        ))
                    });
                hit != negated
            }
        }
    }
}

pub fn compile(
    mailbox: MailboxId,
    snapshot: &[Uid],
    queries: &[SearchQuery],
) -> Result<CompiledSearch, Error> {
    let mut compiler = Compiler {
        snapshot,
        residual: Vec::new(),
    };

    let conjunction = compiler.conjunction(queries)?;

    let mut filter = doc! { "mailbox": mailbox.0 };
    let nothing = match conjunction {
        Conj::Empty | Conj::Undecidable => true,
        Conj::Clauses(clauses) => {
            if !clauses.is_empty() {
                filter.insert("$and", clauses);
            }
            false
        }
    };

    Ok(CompiledSearch {
        filter,
        residual: compiler.residual,
        nothing,
    })
}

struct Compiler<'a> {
    snapshot: &'a [Uid],
    residual: Vec<Residual>,
}

/// The compiled form of a single term.
enum Term {
    /// The `ALL` key: not merely unconstrained, it discards its sibling
    /// constraints and forces a full mailbox scan.
    Scan,
    /// No storage-side constraint.
    Unconstrained,
    /// Provably matches no message.
    Empty,
    /// The index cannot answer this term (a negated full-text match).
    /// A conjunction needing it is unanswerable; a disjunction survives
    /// on its other branch.
    Undecidable,
    Clause(Document),
}

/// The compiled form of an implicitly ANDed list of terms.
enum Conj {
    Empty,
    Undecidable,
    /// Remaining constraints; an empty vector matches everything.
    Clauses(Vec<Document>),
}

impl Compiler<'_> {
    /// Compile a list of criteria that are ANDed together. Negation is
    /// handled per-term; the list itself is always positive.
    ///
    /// An empty term annihilates the whole conjunction, and that beats
    /// even `ALL`'s drop-the-siblings behaviour; an unanswerable term
    /// makes the conjunction unanswerable.
    fn conjunction(
        &mut self,
        queries: &[SearchQuery],
    ) -> Result<Conj, Error> {
        let mut clauses = Vec::new();
        let mut scan = false;
        let mut empty = false;
        let mut undecidable = false;

        for query in queries {
            match self.term(query, false)? {
                Term::Scan => scan = true,
                Term::Unconstrained => {}
                Term::Empty => empty = true,
                Term::Undecidable => undecidable = true,
                Term::Clause(doc) => clauses.push(doc),
            }
        }

        if empty {
            return Ok(Conj::Empty);
        }
        if undecidable {
            return Ok(Conj::Undecidable);
        }
        if scan {
            clauses.clear();
        }
        Ok(Conj::Clauses(clauses))
    }

    fn term(
        &mut self,
        query: &SearchQuery,
        ne: bool,
    ) -> Result<Term, Error> {
        Ok(match *query {
            SearchQuery::All => {
                // Under NOT, `ALL` is a no-op rather than "nothing";
                // matching the empty set from `NOT ALL` helps nobody.
                if ne {
                    Term::Unconstrained
                } else {
                    Term::Scan
                }
            }

            SearchQuery::Not(ref inner) => self.term(inner, !ne)?,

            SearchQuery::And(ref inner) => {
                // The inner list is compiled un-negated; a negation
                // above it wraps the whole conjunction.
                match self.conjunction(inner)? {
                    Conj::Empty => {
                        if ne {
                            Term::Unconstrained
                        } else {
                            Term::Empty
                        }
                    }
                    Conj::Undecidable => Term::Undecidable,
                    Conj::Clauses(mut clauses) => {
                        if clauses.is_empty() {
                            if ne {
                                Term::Empty
                            } else {
                                Term::Unconstrained
                            }
                        } else if ne {
                            Term::Clause(
                                doc! { "$nor": [and_of(clauses)] },
                            )
                        } else if 1 == clauses.len() {
                            Term::Clause(clauses.pop().unwrap())
                        } else {
                            Term::Clause(doc! { "$and": clauses })
                        }
                    }
                }
            }

            SearchQuery::Or(ref a, ref b) => {
                // Each branch is compiled un-negated; a negation above
                // the OR applies to the combined disjunction.
                let left = self.term(a, false)?;
                let right = self.term(b, false)?;
                or_terms(left, right, ne)
            }

            SearchQuery::Text(ref s) | SearchQuery::Body(ref s) => {
                if ne {
                    // The full-text index cannot prove absence.
                    Term::Undecidable
                } else {
                    Term::Clause(doc! { "$text": { "$search": s } })
                }
            }

            SearchQuery::UidSet(ref uids) => self.uid_term(uids, ne),

            SearchQuery::SeqSet(ref seqnums) => {
                let mut uids = SeqRange::new();
                for seqnum in seqnums.items(self.snapshot.len() as u32) {
                    uids.append(self.snapshot[seqnum.to_index()]);
                }
                self.uid_term(&uids, ne)
            }

            SearchQuery::Flag { ref flag, exists } => {
                let want = exists != ne;
                match *flag {
                    Flag::Seen => Term::Clause(doc! { "seen": want }),
                    Flag::Flagged => {
                        Term::Clause(doc! { "flagged": want })
                    }
                    Flag::Deleted => {
                        Term::Clause(doc! { "deleted": want })
                    }
                    ref other => {
                        let name = other.to_string();
                        if want {
                            Term::Clause(doc! { "flags": name })
                        } else {
                            Term::Clause(
                                doc! { "flags": { "$ne": name } },
                            )
                        }
                    }
                }
            }

            SearchQuery::Header { ref name, ref value } => {
                let name = name.to_ascii_lowercase();
                if value.is_empty() {
                    // Degenerate form: any header with this name.
                    if ne {
                        Term::Clause(
                            doc! { "headers.key": { "$ne": &name } },
                        )
                    } else {
                        Term::Clause(doc! { "headers.key": &name })
                    }
                } else {
                    // The comparison is defined over decoded text, so the
                    // real match is residual; the store only prunes on the
                    // header name (and only for the positive form).
                    let pattern = Regex::new(&format!(
                        "(?i){}",
                        regex::escape(value),
                    ))
                    .expect("escaped literal is always a valid regex");
                    self.residual.push(Residual::Header {
                        name: name.clone(),
                        pattern,
                        negated: ne,
                    });
                    if ne {
                        Term::Unconstrained
                    } else {
                        Term::Clause(doc! { "headers.key": &name })
                    }
                }
            }

            SearchQuery::Modseq(v) => {
                if ne {
                    Term::Clause(
                        doc! { "modseq": { "$lt": v as i64 } },
                    )
                } else {
                    Term::Clause(
                        doc! { "modseq": { "$gte": v as i64 } },
                    )
                }
            }

            SearchQuery::InternalDate { cmp, date } => {
                Term::Clause(date_clause("idate", cmp, date, ne))
            }
            SearchQuery::HeaderDate { cmp, date } => {
                Term::Clause(date_clause("hdate", cmp, date, ne))
            }

            SearchQuery::Size { cmp, size } => {
                let size = size as i64;
                let op = match cmp {
                    SizeComparison::Eq => {
                        return Ok(if ne {
                            Term::Clause(
                                doc! { "size": { "$ne": size } },
                            )
                        } else {
                            Term::Clause(doc! { "size": size })
                        });
                    }
                    SizeComparison::Lt => doc! { "$lt": size },
                    SizeComparison::Le => doc! { "$lte": size },
                    SizeComparison::Gt => doc! { "$gt": size },
                    SizeComparison::Ge => doc! { "$gte": size },
                };
                if ne {
                    Term::Clause(doc! { "size": { "$not": op } })
                } else {
                    Term::Clause(doc! { "size": op })
                }
            }
        })
    }

    fn uid_term(&self, uids: &SeqRange<Uid>, ne: bool) -> Term {
        if uids.is_empty() {
            // An empty set matches nothing, so its negation matches
            // everything.
            return if ne {
                Term::Unconstrained
            } else {
                Term::Empty
            };
        }

        let base = match uid_set_filter(uids) {
            Bson::Document(d) if d.contains_key("$or") => d,
            other => doc! { "uid": other },
        };

        if ne {
            Term::Clause(doc! { "$nor": [base] })
        } else {
            Term::Clause(base)
        }
    }
}

/// Combine two compiled OR branches.
///
/// An unanswerable branch contributes the empty set to the disjunction
/// (an under-approximation the other branch survives), but negating a
/// disjunction that leans on an under-approximation would overshoot, so
/// that combination stays unanswerable. `ALL` inside a branch has no
/// sibling-dropping role here; it just makes the disjunction total.
fn or_terms(left: Term, right: Term, ne: bool) -> Term {
    use self::Term::*;

    match (left, right) {
        (Undecidable, Undecidable) => Undecidable,
        (Undecidable, other) | (other, Undecidable) => {
            if ne {
                Undecidable
            } else {
                match other {
                    Scan | Unconstrained => Unconstrained,
                    other => other,
                }
            }
        }

        (Scan | Unconstrained, _) | (_, Scan | Unconstrained) => {
            if ne {
                Empty
            } else {
                Unconstrained
            }
        }

        (Empty, Empty) => {
            if ne {
                Unconstrained
            } else {
                Empty
            }
        }
        (Empty, Clause(c)) | (Clause(c), Empty) => {
            if ne {
                Clause(doc! { "$nor": [c] })
            } else {
                Clause(c)
            }
        }

        (Clause(l), Clause(r)) => {
            let or = doc! { "$or": [l, r] };
            if ne {
                Clause(doc! { "$nor": [or] })
            } else {
                Clause(or)
            }
        }
    }
}

fn and_of(mut clauses: Vec<Document>) -> Document {
    if 1 == clauses.len() {
        clauses.pop().unwrap()
    } else {
        doc! { "$and": clauses }
    }
}

fn date_clause(
    field: &str,
    cmp: DateComparison,
    date: NaiveDate,
    ne: bool,
) -> Document {
    let start = bson_midnight(date);
    let next = bson_midnight(date + chrono::Days::new(1));

    let op = match cmp {
        DateComparison::Day => doc! { "$gte": start, "$lt": next },
        DateComparison::Lt => doc! { "$lt": start },
        DateComparison::Le => doc! { "$lt": next },
        DateComparison::Gt => doc! { "$gte": next },
        DateComparison::Ge => doc! { "$gte": start },
    };

    if ne {
        doc! { field: { "$not": op } }
    } else {
        doc! { field: op }
    }
}

fn bson_midnight(date: NaiveDate) -> bson::DateTime {
    bson::DateTime::from_chrono(date.and_time(NaiveTime::MIN).and_utc())
}

#[cfg(test)]
mod test {
    use mongodb::bson::oid::ObjectId;

    use super::*;

    fn mailbox() -> MailboxId {
        MailboxId(ObjectId::new())
    }

    fn compiled(
        snapshot: &[u32],
        queries: Vec<SearchQuery>,
    ) -> CompiledSearch {
        let snapshot: Vec<Uid> =
            snapshot.iter().copied().map(Uid::u).collect();
        compile(mailbox(), &snapshot, &queries).unwrap()
    }

    fn and_clauses(c: &CompiledSearch) -> Vec<Document> {
        c.filter
            .get_array("$and")
            .map(|a| {
                a.iter()
                    .map(|b| b.as_document().unwrap().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn not(q: SearchQuery) -> SearchQuery {
        SearchQuery::Not(Box::new(q))
    }

    fn or(a: SearchQuery, b: SearchQuery) -> SearchQuery {
        SearchQuery::Or(Box::new(a), Box::new(b))
    }

    fn size_gt(size: u32) -> SearchQuery {
        SearchQuery::Size {
            cmp: SizeComparison::Gt,
            size,
        }
    }

    fn seen() -> SearchQuery {
        SearchQuery::Flag {
            flag: Flag::Seen,
            exists: true,
        }
    }

    #[test]
    fn negated_fulltext_short_circuits_to_empty() {
        let c = compiled(
            &[],
            vec![not(SearchQuery::Text("foo".to_owned()))],
        );
        assert!(c.nothing);
    }

    #[test]
    fn fulltext_compiles_to_text_operator() {
        let c = compiled(&[], vec![SearchQuery::Body("foo".to_owned())]);
        assert_eq!(
            vec![doc! { "$text": { "$search": "foo" } }],
            and_clauses(&c),
        );
        assert!(!c.nothing);
    }

    #[test]
    fn undecidable_or_branch_degrades_to_the_other_branch() {
        // OR (NOT TEXT "foo") (SIZE > 5): the negated full-text branch
        // cannot be answered, but the SIZE branch is still satisfiable
        // and must produce results.
        let c = compiled(
            &[],
            vec![or(
                not(SearchQuery::Text("foo".to_owned())),
                size_gt(5),
            )],
        );
        assert!(!c.nothing);
        assert_eq!(
            vec![doc! { "size": { "$gt": 5i64 } }],
            and_clauses(&c),
        );
    }

    #[test]
    fn negating_an_undecidable_disjunction_is_unanswerable() {
        let c = compiled(
            &[],
            vec![not(or(
                not(SearchQuery::Text("foo".to_owned())),
                size_gt(5),
            ))],
        );
        assert!(c.nothing);
    }

    #[test]
    fn or_where_both_branches_fail_is_empty() {
        let c = compiled(
            &[],
            vec![or(
                SearchQuery::UidSet(SeqRange::new()),
                not(SearchQuery::Body("x".to_owned())),
            )],
        );
        assert!(c.nothing);
    }

    #[test]
    fn or_with_an_empty_branch_is_the_other_branch() {
        let c = compiled(
            &[],
            vec![or(SearchQuery::UidSet(SeqRange::new()), seen())],
        );
        assert!(!c.nothing);
        assert_eq!(vec![doc! { "seen": true }], and_clauses(&c));
    }

    #[test]
    fn empty_uid_set_short_circuits() {
        let c = compiled(&[], vec![SearchQuery::UidSet(SeqRange::new())]);
        assert!(c.nothing);

        // ...but a negated empty set matches everything.
        let c = compiled(
            &[],
            vec![not(SearchQuery::UidSet(SeqRange::new()))],
        );
        assert!(!c.nothing);
        assert!(and_clauses(&c).is_empty());
    }

    #[test]
    fn denormalized_flags_use_boolean_fields() {
        let c = compiled(&[], vec![seen()]);
        assert_eq!(vec![doc! { "seen": true }], and_clauses(&c));

        // UNSEEN
        let c = compiled(
            &[],
            vec![SearchQuery::Flag {
                flag: Flag::Seen,
                exists: false,
            }],
        );
        assert_eq!(vec![doc! { "seen": false }], and_clauses(&c));

        // NOT UNDELETED == DELETED
        let c = compiled(
            &[],
            vec![not(SearchQuery::Flag {
                flag: Flag::Deleted,
                exists: false,
            })],
        );
        assert_eq!(vec![doc! { "deleted": true }], and_clauses(&c));
    }

    #[test]
    fn keyword_flags_match_the_array() {
        let c = compiled(
            &[],
            vec![SearchQuery::Flag {
                flag: Flag::Keyword("Forwarded".to_owned()),
                exists: true,
            }],
        );
        assert_eq!(vec![doc! { "flags": "Forwarded" }], and_clauses(&c));

        let c = compiled(
            &[],
            vec![SearchQuery::Flag {
                flag: Flag::Keyword("Forwarded".to_owned()),
                exists: false,
            }],
        );
        assert_eq!(
            vec![doc! { "flags": { "$ne": "Forwarded" } }],
            and_clauses(&c),
        );
    }

    #[test]
    fn seqnums_resolve_through_the_snapshot() {
        let mut seqs = SeqRange::new();
        seqs.insert(crate::account::model::Seqnum::u(1),
                    crate::account::model::Seqnum::u(2));
        let c = compiled(&[10, 20, 30], vec![SearchQuery::SeqSet(seqs)]);
        assert_eq!(
            vec![doc! { "uid": { "$gte": 10i64, "$lte": 20i64 } }],
            and_clauses(&c),
        );
    }

    #[test]
    fn header_with_value_prunes_by_key_and_defers_to_residual() {
        let c = compiled(
            &[],
            vec![SearchQuery::Header {
                name: "Subject".to_owned(),
                value: "hello".to_owned(),
            }],
        );
        assert_eq!(
            vec![doc! { "headers.key": "subject" }],
            and_clauses(&c),
        );
        assert_eq!(1, c.residual.len());

        // The residual comparison happens over decoded header text.
        let headers = vec![HeaderPair {
            key: "subject".to_owned(),
            value: "=?utf-8?q?say_Hello_world?=".to_owned(),
        }];
        assert!(c.residual[0].matches(&headers));

        let other = vec![HeaderPair {
            key: "subject".to_owned(),
            value: "goodbye".to_owned(),
        }];
        assert!(!c.residual[0].matches(&other));
    }

    #[test]
    fn negated_header_match_is_residual_only() {
        let c = compiled(
            &[],
            vec![not(SearchQuery::Header {
                name: "From".to_owned(),
                value: "mallory".to_owned(),
            })],
        );
        assert!(and_clauses(&c).is_empty());
        assert!(!c.nothing);

        let matching = vec![HeaderPair {
            key: "from".to_owned(),
            value: "Mallory <m@example.com>".to_owned(),
        }];
        assert!(!c.residual[0].matches(&matching));

        let innocent = vec![HeaderPair {
            key: "from".to_owned(),
            value: "Alice <a@example.com>".to_owned(),
        }];
        assert!(c.residual[0].matches(&innocent));
    }

    #[test]
    fn empty_header_value_degenerates_to_key_presence() {
        let c = compiled(
            &[],
            vec![SearchQuery::Header {
                name: "X-Spam".to_owned(),
                value: String::new(),
            }],
        );
        assert_eq!(
            vec![doc! { "headers.key": "x-spam" }],
            and_clauses(&c),
        );
        assert!(c.residual.is_empty());
    }

    #[test]
    fn modseq_comparison_and_negation() {
        let c = compiled(&[], vec![SearchQuery::Modseq(7)]);
        assert_eq!(
            vec![doc! { "modseq": { "$gte": 7i64 } }],
            and_clauses(&c),
        );

        let c = compiled(&[], vec![not(SearchQuery::Modseq(7))]);
        assert_eq!(
            vec![doc! { "modseq": { "$lt": 7i64 } }],
            and_clauses(&c),
        );
    }

    #[test]
    fn dates_without_operator_cover_the_whole_day() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let c = compiled(
            &[],
            vec![SearchQuery::InternalDate {
                cmp: DateComparison::Day,
                date,
            }],
        );

        let clause = &and_clauses(&c)[0];
        let range = clause.get_document("idate").unwrap();
        assert_eq!(
            bson_midnight(date),
            *range.get_datetime("$gte").unwrap(),
        );
        assert_eq!(
            bson_midnight(date + chrono::Days::new(1)),
            *range.get_datetime("$lt").unwrap(),
        );
    }

    #[test]
    fn size_defaults_to_equality() {
        let c = compiled(
            &[],
            vec![SearchQuery::Size {
                cmp: SizeComparison::Eq,
                size: 512,
            }],
        );
        assert_eq!(vec![doc! { "size": 512i64 }], and_clauses(&c));

        let c = compiled(&[], vec![size_gt(512)]);
        assert_eq!(
            vec![doc! { "size": { "$gt": 512i64 } }],
            and_clauses(&c),
        );
    }

    #[test]
    fn or_compiles_both_branches_un_negated() {
        let c = compiled(&[], vec![or(seen(), size_gt(100))]);
        assert_eq!(
            vec![doc! { "$or": [
                { "seen": true },
                { "size": { "$gt": 100i64 } },
            ] }],
            and_clauses(&c),
        );
    }

    #[test]
    fn negated_or_wraps_the_disjunction() {
        let c = compiled(&[], vec![not(or(seen(), size_gt(100)))]);
        assert_eq!(
            vec![doc! { "$nor": [{ "$or": [
                { "seen": true },
                { "size": { "$gt": 100i64 } },
            ] }] }],
            and_clauses(&c),
        );
        assert!(!c.nothing);
    }

    #[test]
    fn all_drops_sibling_constraints() {
        let c = compiled(&[], vec![seen(), SearchQuery::All]);
        assert!(and_clauses(&c).is_empty());
        assert!(!c.nothing);

        // NOT ALL is a no-op, leaving siblings alone.
        let c = compiled(&[], vec![seen(), not(SearchQuery::All)]);
        assert_eq!(vec![doc! { "seen": true }], and_clauses(&c));
    }

    #[test]
    fn an_empty_set_beats_all() {
        // UID <empty> ALL: the empty set still short-circuits even
        // though ALL would otherwise discard its siblings.
        let c = compiled(
            &[],
            vec![SearchQuery::UidSet(SeqRange::new()), SearchQuery::All],
        );
        assert!(c.nothing);
    }
}
