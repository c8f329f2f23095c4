//! Windowed notification feed cache kept coherent across paged fetches,
//! push events and optimistic read-state mutations.

pub mod backend;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod mutations;
pub mod session;
pub mod storage;
pub mod store;
pub mod view;

pub use error::FeedError;
pub use model::{NotificationItem, NotificationKind, Payload, PAGE_SIZE};
pub use session::{CenterOptions, NotificationCenter};
