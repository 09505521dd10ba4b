//! Pool module - Responder pool, judge service and verdict parsing.

mod judge;
mod responder;
pub mod verdict;

pub use judge::*;
pub use responder::*;
pub use verdict::{ParsedVerdict, VerdictParser};
