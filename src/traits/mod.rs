//! Per-operation traits.
//!
//! Every [`Parsable`](crate::Parsable) entity gets these for free; they are
//! thin conveniences over the [`Service`](crate::Service) operations.

mod delete;
mod get;
mod insert;
mod list;
mod update;

pub use delete::Delete;
pub use get::Get;
pub use insert::Insert;
pub use list::{List, MAX_PAGES};
pub use update::Update;
