#[macro_use]
mod macros;

pub mod error;
pub mod message;
pub mod namespace;
pub mod store;
pub mod stream_name;

pub use error::{Error, Result};
pub use message::Message;
pub use namespace::{Namespace, NamespaceStats};
pub use store::{
    GetCategoryMessagesOpts, GetStreamMessagesOpts, Store, StoreHealth, WriteMessageOpts,
    WrittenMessage,
};
pub use stream_name::{consumer_member, hash64, Category, EmptyStreamName, StreamName, ID};
