//! Messages are written to and read from streams, and a stream is identified
//! by its name.
//!
//! A stream name is a string that optionally includes an ID prefixed by a
//! dash (`-`) character. The part preceding the dash is the *category*, and
//! the part following the dash is the ID. A name without a dash is a bare
//! category.
//!
//! # Example stream names
//!
//! `account`
//!
//! Account category stream name. Reading this name as a category returns
//! messages from every account stream.
//!
//! `account-123`
//!
//! Account entity stream name. The stream that has messages only for the
//! particular account with the ID 123.
//!
//! `account-123+456`
//!
//! Compound ID stream name. The first ID (`123`) is the *cardinal* ID;
//! consumer-group routing uses only the cardinal ID, so streams derived from
//! the same base entity land on the same group member.
//!
//! The algebra here is pure and deterministic. Every backend routes lock
//! acquisition, category filtering, and consumer-group partitioning through
//! these same functions, so they must produce identical values everywhere.

mod category;
mod id;

use std::borrow::Cow;
use std::{fmt, str};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::category::Category;
pub use self::id::ID;

/// A stream name containing a category, and optionally an ID.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamName<'a>(Cow<'a, str>);

impl<'a> StreamName<'a> {
    /// ID separator.
    ///
    /// Only the first `-` is the separator; all other `-` characters are part
    /// of the ID.
    ///
    /// # Example
    ///
    /// `category-id`
    pub const ID_SEPARATOR: char = '-';

    pub fn new(stream_name: impl Into<Cow<'a, str>>) -> Result<Self, EmptyStreamName> {
        let stream_name = stream_name.into();
        if stream_name.is_empty() {
            return Err(EmptyStreamName);
        }

        Ok(StreamName(stream_name))
    }

    pub fn from_parts(
        category: Category<'_>,
        id: Option<&ID<'_>>,
    ) -> Result<Self, EmptyStreamName> {
        let mut s = category.into_string();
        if s.is_empty() {
            return Err(EmptyStreamName);
        }
        if let Some(id) = id {
            s.push(Self::ID_SEPARATOR);
            s.push_str(id);
        }

        Ok(StreamName(Cow::Owned(s)))
    }

    /// The category part: everything before the first `-`, or the whole name
    /// when no `-` is present.
    pub fn category(&self) -> Category<'_> {
        self.split_once(Self::ID_SEPARATOR)
            .map(|(category, _)| Category(Cow::Borrowed(category)))
            .unwrap_or(Category(Cow::Borrowed(self.as_ref())))
    }

    /// The ID part: everything after the first `-`, absent for a bare
    /// category.
    pub fn id(&self) -> Option<ID<'_>> {
        self.split_once(Self::ID_SEPARATOR)
            .map(|(_, id)| ID(Cow::Borrowed(id)))
    }

    /// The cardinal ID: the ID up to the first `+`, or the empty string for a
    /// bare category.
    pub fn cardinal_id(&self) -> &str {
        self.split_once(Self::ID_SEPARATOR)
            .map(|(_, id)| id.split_once(ID::COMPOUND_ID_SEPARATOR).map_or(id, |(c, _)| c))
            .unwrap_or("")
    }

    /// Returns whether the stream name is a bare category (no ID).
    pub fn is_category(&self) -> bool {
        !self.contains(Self::ID_SEPARATOR)
    }
}

impl_eq! { StreamName<'a>, &'b str }
impl_eq! { StreamName<'a>, String }
impl_as_ref_str! { StreamName, StreamName<'a>, StreamName<'static> }

/// Stable 64-bit hash of a string, identical across processes and backends.
///
/// Reads the high 16 hex characters of the value's MD5 digest (its first 8
/// bytes) as a big-endian two's-complement 64-bit integer. The Postgres
/// adapter evaluates the same expression in SQL as
/// `('x' || left(md5(value), 16))::bit(64)::bigint`.
pub fn hash64(value: &str) -> i64 {
    let digest = Md5::digest(value.as_bytes());
    let mut high = [0u8; 8];
    high.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(high)
}

/// Consumer-group member a stream is routed to, for a group of `size`
/// members.
///
/// Routing hashes only the cardinal ID, so compound-ID streams land on the
/// same member as their base stream.
pub fn consumer_member(stream_name: &StreamName<'_>, size: i64) -> i64 {
    (hash64(stream_name.cardinal_id()).unsigned_abs() % size as u64) as i64
}

#[derive(Clone, Copy, Debug, Error)]
#[error("empty stream name")]
pub struct EmptyStreamName;
