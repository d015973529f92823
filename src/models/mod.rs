//! GData model types.

mod author;
mod category;
mod entry;
mod feed;
mod link;

pub use author::Author;
pub use category::Category;
pub use entry::{Content, Entry};
pub use feed::Feed;
pub use link::{rel, Link};
