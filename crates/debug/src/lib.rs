//! Interactive debug sessions over the Chrome DevTools Protocol.
//!
//! This crate drives Node.js and browser inspector targets through CDP and
//! exposes the whole surface as a Manifold plug-in command. A session wraps
//! one WebSocket to the target's inspector endpoint, tracks the target's
//! execution state separately from the session's own lifecycle, keeps a
//! breakpoint registry and a bounded console buffer, and coordinates
//! concurrent pause waiters. Sessions stay queryable after the target dies
//! until their owner deletes them.
//!
//! Line and column numbers are 0-based on the CDP wire and 1-based
//! everywhere this crate's API surfaces them.

pub mod breakpoints;
pub mod cdp;
pub mod command;
pub mod console;
pub mod manager;
pub mod session;

pub use breakpoints::{Breakpoint, BreakpointRegistry};
pub use cdp::{CdpClient, CdpError, CdpEvent};
pub use command::DebuggerCommand;
pub use console::{ConsoleBuffer, ConsoleEntry};
pub use manager::SessionManager;
pub use session::{DebugSession, ExecutionState, SessionError, SessionState};
