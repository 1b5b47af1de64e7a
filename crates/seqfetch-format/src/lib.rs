//! Format processors for seqfetch.
//!
//! Each processor understands exactly one wire representation of a blob and
//! is described by a table row: a magic value, a version and a set of
//! decode/encode function values. Adding a format means adding a row to a
//! [`ProcessorTable`], not a new type.
//!
//! # Wire header
//!
//! ```text
//! [4 bytes: magic][2 bytes: version (big-endian u16)][payload]
//! ```
//!
//! Headerless processors (magic `None`) receive the full input and are only
//! tried when no header matches.
//!
//! # Built-in formats
//!
//! | name | magic | payload |
//! |---|---|---|
//! | `whole` | `SQWR` v1 | bincode blob + CRC32 |
//! | `compressed` | `SQWZ` v2 | zstd(bincode blob) + CRC32, inflated size capped |
//! | `split` | `SQSK` v1 | bincode skeleton + CRC32; chunks as `SQCK` v1 |
//! | `json` | none | JSON blob (legacy text records) |

pub mod builtin;
pub mod error;
pub mod processor;
pub mod split;
pub mod table;

pub use error::{FormatError, FormatResult};
pub use processor::{Processor, SplitCodec, HEADER_LEN};
pub use split::split_blob;
pub use table::{Decoded, ProcessorTable};
