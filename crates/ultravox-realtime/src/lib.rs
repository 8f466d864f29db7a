//! Ultravox Realtime Client
//!
//! Client side of an Ultravox call's realtime connection: the JSON message
//! protocol, the [`Session`] that drives one connection, the registry of client
//! tools the agent may invoke, and the events a session publishes to its owner.
//! Creating calls and user interaction live in the CLI service built on top.

pub mod events;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transport;

pub use events::{EventDispatcher, EventKind, Listener, SessionEvent, Subscription};
pub use protocol::CallState;
pub use session::{Session, SessionBuilder, SessionError};
pub use tools::{
    Parameters, RegistryError, ToolDescriptor, ToolError, ToolHandler, ToolRegistry,
    async_tool_fn, tool_fn,
};
