//! Pipeline stages for records-to-document generation.
//!
//! Each submodule implements one transformation step, so each can be tested
//! on its own and the network-facing pieces can be swapped for fakes.
//!
//! ## Data Flow
//!
//! ```text
//! record ──▶ transform ──▶ media ──▶ assemble ──▶ … ──▶ link
//! (fields)   (blocks)     (fetch,   (paragraphs,       (bookmark,
//!                          markers)  pictures)          hyperlinks)
//! ```
//!
//! 1. [`transform`]: classify one record's fields into ordered
//!    [`transform::ContentBlock`]s, deduplicating level-1 headings
//! 2. [`media`]: find image URLs in body text, download them through a
//!    [`fetch::ImageFetcher`] with retry/backoff, normalize and save them,
//!    and leave media markers behind; the only stage with network I/O
//! 3. [`assemble`]: append styled paragraphs and pictures; runs in
//!    `spawn_blocking` together with the rest of the document work
//! 4. [`link`]: once per document, install the index bookmark and
//!    convert return placeholders into internal hyperlinks
//!
//! [`text`] holds the pure text rules the assembler applies to body lines.

pub mod assemble;
pub mod fetch;
pub mod link;
pub mod media;
pub mod text;
pub mod transform;
