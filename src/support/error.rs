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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsafe mailbox name")]
    UnsafeName,
    #[error("Mailbox already exists")]
    MailboxExists,
    #[error("No such mailbox")]
    NxMailbox,
    #[error("No such destination mailbox")]
    NxDestination,
    #[error("Mailbox is reserved for a special use")]
    MailboxReserved,
    #[error("Mailbox opened read-only")]
    MailboxReadOnly,
    #[error("Unsupported/unknown flag")]
    NxFlag,
    #[error("Storage quota would be exceeded")]
    OverQuota,
    #[error("Message larger than the accepted maximum")]
    MessageTooLarge,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Too many logins, try again later")]
    RateLimited,
    #[error("Message sequence number out of range")]
    BadSeqnum,
    #[error("UID allocation overflowed the 32-bit space")]
    UidSpaceExhausted,
    #[error("Body stream failed mid-response")]
    StreamFailure,
    #[error("No such message blob")]
    NxBlob,
    #[error(transparent)]
    Storage(#[from] mongodb::error::Error),
    #[error(transparent)]
    BsonSer(#[from] mongodb::bson::ser::Error),
    #[error(transparent)]
    BsonDe(#[from] mongodb::bson::de::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    PasswordHash(#[from] bcrypt::BcryptError),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}
