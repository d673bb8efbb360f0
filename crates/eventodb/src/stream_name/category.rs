use std::borrow::Cow;
use std::{fmt, str};

use serde::{Deserialize, Serialize};

use super::EmptyStreamName;

/// A stream category: the prefix of a stream name before the first `-`.
///
/// All streams sharing a category form that category's message set, ordered
/// by global position. A bare stream name without a `-` is itself a
/// category.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Category<'a>(pub(crate) Cow<'a, str>);

impl<'a> Category<'a> {
    pub fn new(category: impl Into<Cow<'a, str>>) -> Result<Self, EmptyStreamName> {
        let category = category.into();
        if category.is_empty() {
            return Err(EmptyStreamName);
        }

        Ok(Category(category))
    }

    pub fn into_static(self) -> Category<'static> {
        Category(Cow::Owned(self.0.into_owned()))
    }
}

impl_eq! { Category<'a>, &'b str }
impl_eq! { Category<'a>, String }
impl_as_ref_str! { Category, Category<'a>, Category<'static> }
