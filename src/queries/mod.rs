//! SQL builders for the metadata store.
//!
//! Every function returns a complete SQLite statement string; execution
//! happens in [`crate::db`].

pub mod ddl;
pub mod privacy;
pub mod segments;
pub mod sessions;
pub mod tracks;
