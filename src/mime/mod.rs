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

//! Just enough RFC 5322 / MIME understanding to answer FETCH.
//!
//! Messages are digested once at insertion into the IMAP-shaped metadata
//! (envelope, body structure, header array, searchable text, attachment
//! payloads) that the message documents carry; body content itself stays
//! in the blob store and is only re-walked when a FETCH names a section.

mod header;
mod structure;

pub use self::header::{
    decode_encoded_words, parse_headers, split_message, HeaderPair,
};
pub use self::structure::{
    digest, extract_section, Address, BodyStructure, Envelope,
    MessageDigest, Section, SectionLeaf,
};
