//! Protocol definitions and command encoding.

pub mod commands;
pub mod constants;
pub mod handshake;
pub mod identify;

pub use commands::CommandTimeouts;
pub use handshake::{HandshakeCommand, HandshakeStatus};
pub use identify::{CpuIdentification, ProcessorVariant, classify, normalize};
