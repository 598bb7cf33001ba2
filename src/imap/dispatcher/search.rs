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

use super::defs::*;
use crate::account::model::*;
use crate::account::search;
use crate::imap::response_writer::ResponseWriter;
use crate::imap::syntax::SearchCommand;

impl CommandProcessor {
    pub(super) async fn cmd_search(
        &mut self,
        cmd: SearchCommand,
        uid_mode: bool,
        w: &mut ResponseWriter,
    ) -> CmdResult {
        let (mailbox_id, snapshot) = {
            let selected = selected!(self)?;
            (selected.id(), selected.snapshot().to_vec())
        };

        let compiled =
            search::compile(mailbox_id, &snapshot, &cmd.queries)
                .map_err(|e| map_error(&self.log_prefix, e))?;

        let mut hits: Vec<Uid> = Vec::new();
        let mut max_modseq: Option<Modseq> = None;

        if !compiled.nothing {
            let mut cursor = self
                .storage
                .find_messages(compiled.filter, true)
                .await
                .map_err(|e| map_error(&self.log_prefix, e))?;

            while let Some(message) = cursor
                .try_next()
                .await
                .map_err(|e| map_error(&self.log_prefix, e.into()))?
            {
                // The search is answered against this session's
                // snapshot; rows it hasn't seen yet wait for their
                // EXISTS.
                if snapshot.binary_search(&message.uid).is_err() {
                    continue;
                }
                if !compiled
                    .residual
                    .iter()
                    .all(|r| r.matches(&message.headers))
                {
                    continue;
                }

                hits.push(message.uid);
                max_modseq = Some(
                    max_modseq
                        .map_or(message.modseq, |m| m.max(message.modseq)),
                );
            }
        }

        let rendered: Vec<String> = if uid_mode {
            hits.iter().map(|u| u.0.get().to_string()).collect()
        } else {
            let selected = selected!(self)?;
            hits.iter()
                .filter_map(|&uid| selected.seqnum_of(uid))
                .map(|s| s.0.get().to_string())
                .collect()
        };

        // RFC 7162: a MODSEQ search criterion adds the max modseq of the
        // hits to the untagged SEARCH response.
        let wants_modseq = queries_mention_modseq(&cmd.queries);
        let mut line = String::from("* SEARCH");
        for hit in &rendered {
            line.push(' ');
            line.push_str(hit);
        }
        if let (true, Some(max_modseq)) = (wants_modseq, max_modseq) {
            line.push_str(&format!(
                " (MODSEQ {})",
                max_modseq.wire_value(),
            ));
        }
        w.write_line(&line).await.map_err(|_| bad("I/O error"))?;

        success()
    }
}

fn queries_mention_modseq(queries: &[SearchQuery]) -> bool {
    fn one(q: &SearchQuery) -> bool {
        match *q {
            SearchQuery::Modseq(..) => true,
            SearchQuery::Not(ref inner) => one(inner),
            SearchQuery::Or(ref a, ref b) => one(a) || one(b),
            SearchQuery::And(ref inner) => inner.iter().any(one),
            _ => false,
        }
    }
    queries.iter().any(one)
}
