//! Ultravox CLI Library Crate
//!
//! Everything the `ultravox` binary does beyond wiring: configuration, creating
//! the call over REST, the example client tool and the terminal conversation.
//! The binary is a thin wrapper around this library.

pub mod calls;
pub mod config;
pub mod conversation;
pub mod tools;
