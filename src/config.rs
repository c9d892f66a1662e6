// src/config.rs
//! Node construction knobs.

/// Registrar scheduling priority: how many mailbox messages the registrar
/// handles between cooperative yields. Best-effort; there is no OS-level
/// priority underneath a tokio task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// Messages per scheduling slice.
    pub(crate) fn budget(self) -> usize {
        match self {
            Priority::Low => 8,
            Priority::Normal => 32,
            Priority::High => 128,
        }
    }
}

/// Configuration for a [`Node`](crate::Node).
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Initial registrar priority. Adjustable later via
    /// [`Node::set_priority`](crate::Node::set_priority).
    pub priority: Priority,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { priority: Priority::Normal }
    }
}
