//! Terminal sessions: PTY processes, scrollback, and the registry that owns them.

pub mod pty;
pub mod registry;
pub mod scrollback;

pub use pty::{NativePtyBackend, PtyBackend};
pub use registry::{
    Binding, Outbound, RegistrySettings, SessionRegistry, SessionState, TerminateReason,
};
