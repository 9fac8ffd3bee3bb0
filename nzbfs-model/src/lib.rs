//! Shared data model for the NZB streaming engine: the parsed NZB shape
//! (§3 of the design), the yEnc codec used to decode article bodies, and a
//! minimal NZB XML parser.

pub mod nzb;
pub mod parser;
pub mod yenc;

pub use nzb::{NzbData, NzbError, NzbFile, Segment};
pub use parser::parse_nzb;
