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

use base64::Engine;
use chrono::prelude::*;
use serde::{Deserialize, Serialize};

use super::header::{
    decode_encoded_words, parse_headers, split_message, HeaderPair,
};

/// One slot of an IMAP envelope address: `(name, mailbox, host)`. The
/// obsolete at-domain-list slot is always NIL and not stored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: Option<String>,
    pub mailbox: Option<String>,
    pub host: Option<String>,
}

/// The IMAP-shaped ENVELOPE, digested at insertion.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub date: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub sender: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub in_reply_to: Option<String>,
    pub message_id: Option<String>,
}

/// The IMAP-shaped BODYSTRUCTURE, digested at insertion.
///
/// `children` is non-empty exactly for multipart parts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyStructure {
    pub media_type: String,
    pub media_subtype: String,
    pub params: Vec<(String, String)>,
    pub content_id: Option<String>,
    pub description: Option<String>,
    pub encoding: String,
    pub size: u32,
    /// Line count, for `text/*` parts only.
    pub lines: Option<u32>,
    pub children: Vec<BodyStructure>,
    pub disposition: Option<(String, Vec<(String, String)>)>,
}

impl BodyStructure {
    pub fn is_multipart(&self) -> bool {
        !self.children.is_empty()
    }
}

/// Everything `digest` extracts from a raw message.
pub struct MessageDigest {
    pub envelope: Envelope,
    pub bodystructure: BodyStructure,
    pub headers: Vec<HeaderPair>,
    /// The parsed `Date:` header, or the caller's fallback.
    pub hdate: DateTime<Utc>,
    /// Decoded text content for the full-text index.
    pub text: String,
    /// Decoded payloads of attachment parts, for the blob store.
    pub attachments: Vec<Vec<u8>>,
}

/// Digest a raw RFC 5322 message into its stored metadata.
pub fn digest(raw: &[u8], fallback_date: DateTime<Utc>) -> MessageDigest {
    let (header_block, body) = split_message(raw);
    let headers = parse_headers(header_block);

    let hdate = header_value(&headers, "date")
        .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(fallback_date);

    let envelope = build_envelope(&headers);

    let mut text = String::new();
    if let Some(ref subject) = envelope.subject {
        text.push_str(subject);
        text.push('\n');
    }
    let mut attachments = Vec::new();
    let bodystructure =
        build_structure(&headers, body, &mut text, &mut attachments);

    MessageDigest {
        envelope,
        bodystructure,
        headers,
        hdate,
        text,
        attachments,
    }
}

fn header_value<'a>(
    headers: &'a [HeaderPair],
    key: &str,
) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.key == key)
        .map(|h| h.value.as_str())
}

fn build_envelope(headers: &[HeaderPair]) -> Envelope {
    let addresses = |key: &str| {
        header_value(headers, key)
            .map(parse_address_list)
            .unwrap_or_default()
    };

    let from = addresses("from");
    Envelope {
        date: header_value(headers, "date").map(str::to_owned),
        subject: header_value(headers, "subject")
            .map(decode_encoded_words),
        sender: {
            let sender = addresses("sender");
            if sender.is_empty() {
                from.clone()
            } else {
                sender
            }
        },
        reply_to: {
            let reply_to = addresses("reply-to");
            if reply_to.is_empty() {
                from.clone()
            } else {
                reply_to
            }
        },
        from,
        to: addresses("to"),
        cc: addresses("cc"),
        bcc: addresses("bcc"),
        in_reply_to: header_value(headers, "in-reply-to")
            .map(str::to_owned),
        message_id: header_value(headers, "message-id")
            .map(str::to_owned),
    }
}

/// Parse an address list, tolerating most of what real mail contains.
///
/// Groups are flattened and route information discarded; both are
/// obsolete syntax nobody has sent in decades.
fn parse_address_list(value: &str) -> Vec<Address> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in value.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                items.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    items.push(current);

    items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(parse_address)
        .collect()
}

fn parse_address(item: &str) -> Address {
    let (name, addr) = match (item.find('<'), item.rfind('>')) {
        (Some(open), Some(close)) if open < close => {
            let name = item[..open].trim().trim_matches('"').trim();
            let name = if name.is_empty() {
                None
            } else {
                Some(decode_encoded_words(name))
            };
            (name, item[open + 1..close].trim())
        }
        _ => (None, item),
    };

    match addr.rsplit_once('@') {
        Some((mailbox, host)) => Address {
            name,
            mailbox: Some(mailbox.to_owned()),
            host: Some(host.to_owned()),
        },
        None => Address {
            name,
            mailbox: Some(addr.to_owned()),
            host: None,
        },
    }
}

fn content_type(
    headers: &[HeaderPair],
) -> (String, String, Vec<(String, String)>) {
    let Some(value) = header_value(headers, "content-type") else {
        return ("text".to_owned(), "plain".to_owned(), Vec::new());
    };

    let mut segments = value.split(';');
    let mime_type = segments.next().unwrap_or("").trim();
    let (media_type, media_subtype) = match mime_type.split_once('/') {
        Some((t, s)) => (
            t.trim().to_ascii_lowercase(),
            s.trim().to_ascii_lowercase(),
        ),
        None => ("text".to_owned(), "plain".to_owned()),
    };

    let params = parse_params(segments);
    (media_type, media_subtype, params)
}

fn parse_params<'a>(
    segments: impl Iterator<Item = &'a str>,
) -> Vec<(String, String)> {
    segments
        .filter_map(|segment| {
            let (key, value) = segment.split_once('=')?;
            Some((
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_owned(),
            ))
        })
        .collect()
}

fn build_structure(
    headers: &[HeaderPair],
    body: &[u8],
    text: &mut String,
    attachments: &mut Vec<Vec<u8>>,
) -> BodyStructure {
    let (media_type, media_subtype, params) = content_type(headers);
    let encoding = header_value(headers, "content-transfer-encoding")
        .map(|e| e.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "7bit".to_owned());
    let disposition =
        header_value(headers, "content-disposition").map(|value| {
            let mut segments = value.split(';');
            let kind = segments
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase();
            (kind, parse_params(segments))
        });

    let mut structure = BodyStructure {
        media_subtype,
        params,
        content_id: header_value(headers, "content-id")
            .map(str::to_owned),
        description: header_value(headers, "content-description")
            .map(str::to_owned),
        encoding,
        size: body.len() as u32,
        lines: None,
        children: Vec::new(),
        disposition,
        media_type,
    };

    if "multipart" == structure.media_type {
        let boundary = structure
            .params
            .iter()
            .find(|(k, _)| "boundary" == k)
            .map(|(_, v)| v.clone());
        if let Some(boundary) = boundary {
            for segment in split_multipart(body, &boundary) {
                let (child_headers, child_body) = split_message(segment);
                let child_headers = parse_headers(child_headers);
                structure.children.push(build_structure(
                    &child_headers,
                    child_body,
                    text,
                    attachments,
                ));
            }
        }
        return structure;
    }

    let decoded = decode_transfer_encoding(&structure.encoding, body);

    let is_attachment = matches!(
        structure.disposition,
        Some((ref kind, _)) if "attachment" == kind
    );
    if is_attachment {
        attachments.push(decoded);
    } else if "text" == structure.media_type {
        structure.lines =
            Some(body.iter().filter(|&&b| b'\n' == b).count() as u32);
        let charset = structure
            .params
            .iter()
            .find(|(k, _)| "charset" == k)
            .map(|(_, v)| v.as_str())
            .unwrap_or("utf-8");
        let decoded = match encoding_rs::Encoding::for_label(
            charset.as_bytes(),
        ) {
            Some(encoding) => encoding.decode(&decoded).0.into_owned(),
            None => String::from_utf8_lossy(&decoded).into_owned(),
        };
        text.push_str(&decoded);
        text.push('\n');
    }

    structure
}

/// Split a multipart body at its boundary delimiters, returning the raw
/// part segments. Preamble and epilogue are discarded.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("--{}", boundary);
    let mut parts = Vec::new();
    let mut part_start: Option<usize> = None;
    let mut ix = 0;

    while ix <= body.len() {
        let line_end = body[ix..]
            .iter()
            .position(|&b| b'\n' == b)
            .map(|p| ix + p + 1)
            .unwrap_or(body.len());
        let line = trim_line(&body[ix..line_end]);

        let is_delimiter = line.starts_with(delimiter.as_bytes())
            && matches!(
                &line[delimiter.len()..],
                [] | [b'-', b'-', ..]
            );
        if is_delimiter {
            if let Some(start) = part_start {
                // The CRLF before the delimiter belongs to the delimiter.
                let mut end = ix;
                if end > start && b'\n' == body[end - 1] {
                    end -= 1;
                    if end > start && b'\r' == body[end - 1] {
                        end -= 1;
                    }
                }
                parts.push(&body[start..end]);
            }
            if line[delimiter.len()..].starts_with(b"--") {
                break;
            }
            part_start = Some(line_end);
        }

        if line_end >= body.len() {
            break;
        }
        ix = line_end;
    }

    parts
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn decode_transfer_encoding(encoding: &str, body: &[u8]) -> Vec<u8> {
    match encoding {
        "base64" => {
            let compact: Vec<u8> = body
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            base64::engine::general_purpose::STANDARD
                .decode(&compact)
                .unwrap_or_else(|_| body.to_vec())
        }
        "quoted-printable" => decode_quoted_printable(body),
        _ => body.to_vec(),
    }
}

fn decode_quoted_printable(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    let mut ix = 0;
    while ix < body.len() {
        if b'=' != body[ix] {
            out.push(body[ix]);
            ix += 1;
            continue;
        }

        // Soft line breaks, both endings, and a bare trailing '='.
        if body[ix + 1..].starts_with(b"\r\n") {
            ix += 3;
        } else if body[ix + 1..].starts_with(b"\n") {
            ix += 2;
        } else if ix + 1 == body.len() {
            ix += 1;
        } else {
            match body
                .get(ix + 1..ix + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
            {
                Some(byte) => {
                    out.push(byte);
                    ix += 3;
                }
                None => {
                    out.push(b'=');
                    ix += 1;
                }
            }
        }
    }
    out
}

/// A parsed `BODY[…]` section specifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    /// Numeric part path, e.g. `[1, 2]` for `1.2`. Empty addresses the
    /// whole message.
    pub path: Vec<u32>,
    pub leaf: SectionLeaf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SectionLeaf {
    /// The addressed part in full (the whole message for an empty path,
    /// the part body for a numeric path).
    Full,
    /// The header block, including the trailing blank line.
    Header,
    /// `HEADER.FIELDS` / `HEADER.FIELDS.NOT`.
    HeaderFields { fields: Vec<String>, negate: bool },
    /// The body, excluding headers.
    Text,
}

impl Section {
    pub fn full() -> Self {
        Self {
            path: Vec::new(),
            leaf: SectionLeaf::Full,
        }
    }
}

/// Extract the bytes of a section from a raw message, on demand.
///
/// Content is returned in its transfer encoding, exactly as stored; IMAP
/// clients decode for themselves. Returns `None` for a part path that
/// does not exist.
pub fn extract_section(raw: &[u8], section: &Section) -> Option<Vec<u8>> {
    let mut current: &[u8] = raw;
    // Whether navigation has already peeled the headers off `current`
    // (the part-1-of-a-non-multipart special case).
    let mut headerless = false;

    for (depth, &index) in section.path.iter().enumerate() {
        let (header_block, body) = split_message(current);
        let headers = parse_headers(header_block);
        let (media_type, _, params) = content_type(&headers);

        if "multipart" == media_type {
            let boundary = params
                .iter()
                .find(|(k, _)| "boundary" == k)
                .map(|(_, v)| v.clone())?;
            let parts = split_multipart(body, &boundary);
            current = parts.get(index as usize - 1)?;
        } else if 1 == index && 0 == depth {
            // Part 1 of a non-multipart message is its own body.
            current = body;
            headerless = true;
        } else {
            return None;
        }
    }

    if let SectionLeaf::Full = section.leaf {
        return Some(if section.path.is_empty() || headerless {
            // BODY[] is the entire message, and a headerless part is
            // already bare content...
            current.to_vec()
        } else {
            // ...but BODY[n] is the part's content without its MIME
            // headers.
            split_message(current).1.to_vec()
        });
    }

    let (header_block, body) = if headerless {
        (&[][..], current)
    } else {
        split_message(current)
    };
    Some(match section.leaf {
        SectionLeaf::Full => unreachable!("handled above"),
        SectionLeaf::Header => {
            let mut bytes = header_block.to_vec();
            bytes.extend_from_slice(b"\r\n");
            bytes
        }
        SectionLeaf::HeaderFields { ref fields, negate } => {
            let mut bytes = Vec::new();
            for header in parse_headers(header_block) {
                let listed = fields
                    .iter()
                    .any(|f| f.eq_ignore_ascii_case(&header.key));
                if listed != negate {
                    bytes.extend_from_slice(header.key.as_bytes());
                    bytes.extend_from_slice(b": ");
                    bytes.extend_from_slice(header.value.as_bytes());
                    bytes.extend_from_slice(b"\r\n");
                }
            }
            bytes.extend_from_slice(b"\r\n");
            bytes
        }
        SectionLeaf::Text => body.to_vec(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    const SIMPLE: &[u8] = b"Date: Tue, 5 Mar 2024 10:00:00 +0000\r\n\
From: \"Alice Prime\" <alice@example.com>\r\n\
To: bob@example.com, Carol <carol@example.net>\r\n\
Subject: =?utf-8?q?caf=C3=A9_plans?=\r\n\
Message-ID: <m1@example.com>\r\n\
\r\n\
Meet at the cafe?\r\n";

    const MULTIPART: &[u8] = b"From: alice@example.com\r\n\
Subject: report\r\n\
Content-Type: multipart/mixed; boundary=\"xyz\"\r\n\
\r\n\
preamble\r\n\
--xyz\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Here is the report.\r\n\
--xyz\r\n\
Content-Type: application/pdf\r\n\
Content-Transfer-Encoding: base64\r\n\
Content-Disposition: attachment; filename=\"r.pdf\"\r\n\
\r\n\
aGVsbG8=\r\n\
--xyz--\r\n\
epilogue\r\n";

    #[test]
    fn digests_simple_message() {
        let fallback = Utc::now();
        let digest = digest(SIMPLE, fallback);

        assert_eq!(
            Some("caf\u{e9} plans".to_owned()),
            digest.envelope.subject,
        );
        assert_eq!(
            vec![Address {
                name: Some("Alice Prime".to_owned()),
                mailbox: Some("alice".to_owned()),
                host: Some("example.com".to_owned()),
            }],
            digest.envelope.from,
        );
        assert_eq!(2, digest.envelope.to.len());
        assert_eq!(
            Some("Carol".to_owned()),
            digest.envelope.to[1].name,
        );
        // sender/reply-to fall back to From
        assert_eq!(digest.envelope.from, digest.envelope.sender);
        assert_eq!(
            Some("<m1@example.com>".to_owned()),
            digest.envelope.message_id,
        );

        assert_eq!(
            Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap(),
            digest.hdate,
        );

        assert_eq!("text", digest.bodystructure.media_type);
        assert_eq!("plain", digest.bodystructure.media_subtype);
        assert_eq!(Some(1), digest.bodystructure.lines);
        assert!(digest.text.contains("Meet at the cafe?"));
        assert!(digest.attachments.is_empty());
    }

    #[test]
    fn digests_multipart_with_attachment() {
        let digest = digest(MULTIPART, Utc::now());

        assert!(digest.bodystructure.is_multipart());
        assert_eq!("mixed", digest.bodystructure.media_subtype);
        assert_eq!(2, digest.bodystructure.children.len());
        assert_eq!(
            "text",
            digest.bodystructure.children[0].media_type,
        );
        assert_eq!(
            "application",
            digest.bodystructure.children[1].media_type,
        );

        // The attachment payload is stored decoded.
        assert_eq!(vec![b"hello".to_vec()], digest.attachments);
        // Attachment content does not pollute the search text.
        assert!(digest.text.contains("Here is the report."));
        assert!(!digest.text.contains("aGVsbG8"));
    }

    #[test]
    fn extracts_header_text_and_part_sections() {
        let header = extract_section(
            SIMPLE,
            &Section {
                path: vec![],
                leaf: SectionLeaf::Header,
            },
        )
        .unwrap();
        assert!(header.starts_with(b"Date:"));
        assert!(header.ends_with(b"\r\n\r\n"));

        let text = extract_section(
            SIMPLE,
            &Section {
                path: vec![],
                leaf: SectionLeaf::Text,
            },
        )
        .unwrap();
        assert_eq!(b"Meet at the cafe?\r\n".to_vec(), text);

        let full = extract_section(SIMPLE, &Section::full()).unwrap();
        assert_eq!(SIMPLE.to_vec(), full);

        // BODY[2] is the part content, transfer-encoded, without the
        // part's MIME headers.
        let part2 = extract_section(
            MULTIPART,
            &Section {
                path: vec![2],
                leaf: SectionLeaf::Full,
            },
        )
        .unwrap();
        assert_eq!(b"aGVsbG8=".to_vec(), part2);

        assert_eq!(
            None,
            extract_section(
                MULTIPART,
                &Section {
                    path: vec![3],
                    leaf: SectionLeaf::Full,
                },
            ),
        );
    }

    #[test]
    fn header_fields_filtering() {
        let listed = extract_section(
            SIMPLE,
            &Section {
                path: vec![],
                leaf: SectionLeaf::HeaderFields {
                    fields: vec!["subject".to_owned()],
                    negate: false,
                },
            },
        )
        .unwrap();
        let listed = String::from_utf8(listed).unwrap();
        assert!(listed.contains("subject:"));
        assert!(!listed.contains("from:"));

        let negated = extract_section(
            SIMPLE,
            &Section {
                path: vec![],
                leaf: SectionLeaf::HeaderFields {
                    fields: vec!["subject".to_owned()],
                    negate: true,
                },
            },
        )
        .unwrap();
        let negated = String::from_utf8(negated).unwrap();
        assert!(!negated.contains("subject:"));
        assert!(negated.contains("from:"));
    }

    #[test]
    fn quoted_printable_decoding() {
        assert_eq!(
            b"a=b\r\nsoft line".to_vec(),
            decode_quoted_printable(b"a=3Db\r\nsoft =\r\nline"),
        );
    }

    #[test]
    fn part_one_of_single_part_message_is_the_body() {
        let part1 = extract_section(
            SIMPLE,
            &Section {
                path: vec![1],
                leaf: SectionLeaf::Full,
            },
        )
        .unwrap();
        assert_eq!(b"Meet at the cafe?\r\n".to_vec(), part1);
    }
}
