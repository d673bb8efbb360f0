use std::{borrow::Cow, fmt, str};

use serde::{Deserialize, Serialize};

use super::EmptyStreamName;

/// A stream ID or list of IDs.
///
/// # Examples
///
/// `account1`
///
/// A single stream ID.
///
/// `account1+account2`
///
/// A compound stream ID. The first part is the cardinal ID.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ID<'a>(pub(crate) Cow<'a, str>);

impl<'a> ID<'a> {
    /// Compound ID separator.
    ///
    /// When multiple IDs are present, they are separated by a plus (`+`)
    /// character.
    ///
    /// # Example
    ///
    /// `account1+account2`
    pub const COMPOUND_ID_SEPARATOR: char = '+';

    pub fn new(id: impl Into<Cow<'a, str>>) -> Result<Self, EmptyStreamName> {
        let id = id.into();
        if id.is_empty() {
            return Err(EmptyStreamName);
        }

        Ok(ID(id))
    }

    /// Returns the cardinal ID.
    ///
    /// This is the first ID. If there is only one ID present, that is the
    /// cardinal ID.
    pub fn cardinal_id(&self) -> &str {
        self.split_once(Self::COMPOUND_ID_SEPARATOR)
            .map(|(id, _)| id)
            .unwrap_or(&self.0)
    }
}

impl_eq! { ID<'a>, &'b str }
impl_eq! { ID<'a>, String }
impl_as_ref_str! { ID, ID<'a>, ID<'static> }
