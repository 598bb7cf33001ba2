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

use mongodb::bson::{doc, spec::BinarySubtype, Binary};
use sha2::{Digest, Sha256};

use super::{AttachmentFile, AttachmentMetadata, MessageId, Storage};
use crate::support::error::Error;

/// Compute the content address of a blob.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{:02x}", byte);
    }
    hex
}

impl Storage {
    /// Store a blob under its content address with an initial reference
    /// from `message`, or add the reference if the content is already
    /// stored.
    ///
    /// Returns the content hash. The upsert keeps this correct against a
    /// concurrent sweep: either the sweep's conditional delete wins and
    /// the upsert recreates the blob with one reference, or the reference
    /// lands first and the conditional delete refuses.
    pub async fn put_blob(
        &self,
        data: &[u8],
        message: MessageId,
    ) -> Result<String, Error> {
        let hash = content_hash(data);

        let updated = self
            .attachments
            .update_one(
                doc! { "_id": &hash },
                doc! { "$push": { "metadata.messages": message.0 } },
            )
            .await?;

        if 0 == updated.matched_count {
            let file = AttachmentFile {
                id: hash.clone(),
                length: data.len() as u32,
                data: Binary {
                    subtype: BinarySubtype::Generic,
                    bytes: data.to_vec(),
                },
                metadata: AttachmentMetadata {
                    messages: vec![message],
                },
            };
            match self.attachments.insert_one(&file).await {
                Ok(_) => {}
                // Lost an insert race; the other writer owns the document
                // now, so record our reference on it instead.
                Err(e) if is_duplicate_key(&e) => {
                    self.attachments
                        .update_one(
                            doc! { "_id": &hash },
                            doc! { "$push": {
                                "metadata.messages": message.0,
                            } },
                        )
                        .await?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(hash)
    }

    pub async fn get_blob(&self, hash: &str) -> Result<Vec<u8>, Error> {
        let file = self
            .attachments
            .find_one(doc! { "_id": hash })
            .await?
            .ok_or(Error::NxBlob)?;
        Ok(file.data.bytes)
    }

    /// Record one additional reference from `message` on each listed blob.
    pub async fn link_blobs(
        &self,
        hashes: &[String],
        message: MessageId,
    ) -> Result<(), Error> {
        for hash in hashes {
            self.attachments
                .update_one(
                    doc! { "_id": hash },
                    doc! { "$push": { "metadata.messages": message.0 } },
                )
                .await?;
        }
        Ok(())
    }

    /// Remove every reference from `message` on each listed blob.
    ///
    /// `$pull` drops all occurrences of the id, which is exactly right
    /// here: references are only removed when the referencing message
    /// itself is destroyed.
    pub async fn unlink_blobs(
        &self,
        hashes: &[String],
        message: MessageId,
    ) -> Result<(), Error> {
        for hash in hashes {
            self.attachments
                .update_one(
                    doc! { "_id": hash },
                    doc! { "$pull": { "metadata.messages": message.0 } },
                )
                .await?;
        }
        Ok(())
    }

    /// Delete the blob if and only if its reference multiset is empty.
    ///
    /// The emptiness check and the delete are one find-and-delete, so an
    /// APPEND that re-references the content concurrently either lands its
    /// reference first (delete refuses) or finds no document and stores
    /// the blob anew.
    pub async fn sweep_blob(&self, hash: &str) -> Result<bool, Error> {
        let deleted = self
            .attachments
            .find_one_and_delete(doc! {
                "_id": hash,
                "metadata.messages": { "$size": 0 },
            })
            .await?;
        Ok(deleted.is_some())
    }
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, WriteFailure};
    matches!(
        *e.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref we)) if 11000 == we.code
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn content_hash_is_stable_and_hex() {
        let h = content_hash(b"hello world");
        assert_eq!(
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
            h,
        );
        assert_eq!(h, content_hash(b"hello world"));
        assert_ne!(h, content_hash(b"hello worle"));
    }
}
