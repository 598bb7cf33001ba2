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
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One `{key, value}` pair from a message's header block. Keys are
/// lowercased at parse time; values keep their original (folded lines
/// joined) octets, including any encoded words.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPair {
    pub key: String,
    pub value: String,
}

/// Split a raw message into its header block and body, excluding the
/// blank separator line from both.
pub fn split_message(raw: &[u8]) -> (&[u8], &[u8]) {
    let mut ix = 0;
    while ix < raw.len() {
        let line_end = raw[ix..]
            .iter()
            .position(|&b| b'\n' == b)
            .map(|p| ix + p + 1)
            .unwrap_or(raw.len());
        let line = &raw[ix..line_end];
        if line == b"\r\n" || line == b"\n" {
            return (&raw[..ix], &raw[line_end..]);
        }
        ix = line_end;
    }
    (raw, &[])
}

/// Parse a header block into pairs, unfolding continuation lines.
///
/// Malformed lines (no colon) are skipped rather than failing the whole
/// message; real mail is full of them.
pub fn parse_headers(header_block: &[u8]) -> Vec<HeaderPair> {
    let mut unfolded: Vec<Vec<u8>> = Vec::new();
    for line in header_block.split(|&b| b'\n' == b) {
        let line = match line.strip_suffix(b"\r") {
            Some(stripped) => stripped,
            None => line,
        };
        if line.is_empty() {
            continue;
        }
        if (line[0] == b' ' || line[0] == b'\t')
            && !unfolded.is_empty()
        {
            let last = unfolded.last_mut().unwrap();
            last.push(b' ');
            last.extend_from_slice(trim_bytes(line));
        } else {
            unfolded.push(line.to_vec());
        }
    }

    let mut headers = Vec::with_capacity(unfolded.len());
    for line in unfolded {
        let Some(colon) = line.iter().position(|&b| b':' == b) else {
            continue;
        };
        let key = String::from_utf8_lossy(trim_bytes(&line[..colon]))
            .to_lowercase();
        if key.is_empty() {
            continue;
        }
        let value =
            String::from_utf8_lossy(trim_bytes(&line[colon + 1..]))
                .into_owned();
        headers.push(HeaderPair { key, value });
    }
    headers
}

fn trim_bytes(mut bytes: &[u8]) -> &[u8] {
    while let Some((&b' ' | &b'\t', rest)) = bytes.split_first() {
        bytes = rest;
    }
    while let Some((&b' ' | &b'\t', rest)) = bytes.split_last() {
        bytes = rest;
    }
    bytes
}

lazy_static! {
    static ref ENCODED_WORD: Regex = Regex::new(
        r"=\?([^?]+)\?([bBqQ])\?([^?]*)\?="
    )
    .unwrap();
}

/// Decode RFC 2047 encoded words into display text.
///
/// Unknown charsets and corrupt payloads leave the word as-is; the result
/// is always valid UTF-8 regardless.
pub fn decode_encoded_words(value: &str) -> String {
    ENCODED_WORD
        .replace_all(value, |caps: &regex::Captures| {
            let charset = &caps[1];
            let payload = &caps[3];
            let bytes = match &caps[2] {
                "b" | "B" => {
                    match base64::engine::general_purpose::STANDARD
                        .decode(payload)
                    {
                        Ok(bytes) => bytes,
                        Err(_) => return caps[0].to_owned(),
                    }
                }
                _ => decode_q(payload),
            };

            let charset = charset
                .split('*')
                .next()
                .unwrap_or(charset);
            match encoding_rs::Encoding::for_label(charset.as_bytes()) {
                Some(encoding) => {
                    encoding.decode(&bytes).0.into_owned()
                }
                None => String::from_utf8_lossy(&bytes).into_owned(),
            }
        })
        .into_owned()
}

fn decode_q(payload: &str) -> Vec<u8> {
    let bytes = payload.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut ix = 0;
    while ix < bytes.len() {
        match bytes[ix] {
            b'_' => {
                out.push(b' ');
                ix += 1;
            }
            b'=' => {
                let hex = bytes.get(ix + 1..ix + 3);
                match hex.and_then(|h| {
                    u8::from_str_radix(
                        std::str::from_utf8(h).ok()?,
                        16,
                    )
                    .ok()
                }) {
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
            b => {
                out.push(b);
                ix += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splits_header_and_body_with_either_line_ending() {
        let (h, b) =
            split_message(b"Subject: x\r\nFrom: y\r\n\r\nbody\r\n");
        assert_eq!(b"Subject: x\r\nFrom: y\r\n", h);
        assert_eq!(b"body\r\n", b);

        let (h, b) = split_message(b"Subject: x\n\nbody");
        assert_eq!(b"Subject: x\n", h);
        assert_eq!(b"body", b);

        // Headers only, no body separator.
        let (h, b) = split_message(b"Subject: x\r\n");
        assert_eq!(b"Subject: x\r\n", h);
        assert_eq!(b"", b);
    }

    #[test]
    fn parses_and_unfolds_headers() {
        let headers = parse_headers(
            b"Subject: a folded\r\n\theader value\r\n\
              FROM: someone@example.com\r\n\
              garbage line\r\n\
              X-Empty:\r\n",
        );
        assert_eq!(
            vec![
                HeaderPair {
                    key: "subject".to_owned(),
                    value: "a folded header value".to_owned(),
                },
                HeaderPair {
                    key: "from".to_owned(),
                    value: "someone@example.com".to_owned(),
                },
                HeaderPair {
                    key: "x-empty".to_owned(),
                    value: String::new(),
                },
            ],
            headers,
        );
    }

    #[test]
    fn decodes_q_and_b_encoded_words() {
        assert_eq!(
            "say Hello world",
            decode_encoded_words("=?utf-8?q?say_Hello_world?="),
        );
        assert_eq!(
            "caf\u{e9}",
            decode_encoded_words("=?utf-8?B?Y2Fmw6k=?="),
        );
        assert_eq!(
            "caf\u{e9}",
            decode_encoded_words("=?iso-8859-1?q?caf=E9?="),
        );
        // Plain text passes through untouched.
        assert_eq!("hello", decode_encoded_words("hello"));
        // Corrupt base64 survives verbatim.
        assert_eq!(
            "=?utf-8?B?!!!?=",
            decode_encoded_words("=?utf-8?B?!!!?="),
        );
    }
}
