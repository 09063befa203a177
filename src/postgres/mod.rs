pub mod client;
pub mod log_store;
pub mod metadata;

pub use client::connect;
pub use log_store::{LogKind, LogRow, LogStore};
pub use metadata::{ColumnMeta, MetadataCache};
