//! Canopy Core - Shared protocol types
//!
//! This crate contains the protocol types shared between the Canopy CLI
//! (`canopy`) and the supervisor daemon (`canopy-server`) for communication
//! via the Unix control socket, plus the reversible path <-> id codec used
//! to address servers without escaping filesystem paths.

mod id;
mod protocol;

pub use id::*;
pub use protocol::*;
