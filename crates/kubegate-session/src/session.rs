use std::sync::Arc;

use crate::portforward::PortForwardSession;
use crate::terminal::TerminalSession;

/// A registry entry: one long-lived session of either kind
#[derive(Clone)]
pub enum Session {
    PortForward(Arc<PortForwardSession>),
    Terminal(Arc<TerminalSession>),
}

impl Session {
    pub fn id(&self) -> &str {
        match self {
            Self::PortForward(session) => session.id(),
            Self::Terminal(session) => session.id(),
        }
    }

    /// Fire the session's stop signal. The owning task removes the registry
    /// entry once it has shut down.
    pub fn stop(&self) {
        match self {
            Self::PortForward(session) => session.stop(),
            Self::Terminal(session) => session.stop(),
        }
    }

    pub fn as_port_forward(&self) -> Option<&Arc<PortForwardSession>> {
        match self {
            Self::PortForward(session) => Some(session),
            Self::Terminal(_) => None,
        }
    }
}
