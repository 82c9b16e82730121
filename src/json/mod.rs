//! JSON codec
//!
//! Bidirectional mapping between runtime objects and the compact tagged
//! JSON form used by compiled stories and save states.

pub mod reader;
pub mod writer;
