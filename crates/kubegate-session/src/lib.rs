//! Long-lived sessions for kubegate
//!
//! This crate provides the session registry, the port-forward manager and the
//! terminal bridge. All cluster access goes through `kubegate_k8s::ClusterBackend`.

mod portforward;
mod registry;
mod relay;
mod session;
mod terminal;

#[cfg(test)]
mod testing;

pub use portforward::{
    PortForwardConfig, PortForwardError, PortForwardManager, PortForwardSession, PortForwardState,
};
pub use registry::{SessionOrigin, SessionRegistry};
pub use session::Session;
pub use terminal::{
    DEFAULT_SHELL, Frame, ShellPolicy, TerminalConfig, TerminalManager, TerminalSession,
};

// Re-export types used in our public API
pub use kubegate_types::{PodTarget, TerminalMessage, TerminalSize};
