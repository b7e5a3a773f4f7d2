//! Wire vocabulary shared by the transfer engine and transport implementations.
//!
//! Nothing here performs I/O. The types describe what a chunk operation
//! sends (`Range`, `If-Match`) and what it gets back (ETags, content ranges,
//! commit records), plus the status classification that decides whether a
//! failed request is worth retrying.

pub mod error;
pub mod range;
pub mod status;
pub mod types;

// Re-export primary types for convenience.
pub use error::ProtocolError;
pub use range::{ContentRange, HttpRange};
pub use status::StatusClass;
pub use types::{AppendResponse, CreateResponse, ETag, FlushResponse, ObjectProperties};
