//! Incremental framing and parsing of streamed card payloads.
//!
//! Response bodies arrive in arbitrary chunks. `BlockFramer` buffers them,
//! cuts complete blocks according to the wire format (SSE, NDJSON,
//! delimiter-framed or plain JSON) and keeps the incomplete tail for the
//! next chunk. `parse_block` turns one block into JSON values, degrading
//! anything unparseable to a raw string instead of failing.

pub mod decode;
pub mod detect;
pub mod error;
pub mod framer;
pub mod normalize;
pub mod parse;

pub use decode::Utf8Decoder;
pub use detect::detect_format;
pub use error::{StreamError, StreamResult};
pub use framer::{BlockFramer, FramedBlock};
pub use normalize::{normalize_item, normalize_records};
pub use parse::parse_block;
