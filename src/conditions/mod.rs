//! Upload and import conditions
//!
//! - `checker`: periodic sweep over the owned writing slices
//! - `close`: file and slice close operations run by the sweep
//! - `closer`: moves closing slices to uploading and closing files to importing

mod checker;
mod close;
mod closer;

pub use checker::{CheckReport, Checker};
pub use closer::Closer;
