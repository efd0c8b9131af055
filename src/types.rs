//! Data structures used throughout the hoster daemon.
//!
//! A [`ContainerRecord`] is the normalized view of one running container:
//! the addresses it can be reached on and the names that should resolve to
//! them.  Records are built once per start event and never mutated while
//! rendering.

use std::collections::BTreeSet;

/// An address paired with the hostnames that should resolve to it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkBinding {
    /// IPv4/IPv6 address, or empty when the network has not assigned one
    /// yet.  Empty bindings are kept but never rendered.
    pub ip: String,
    /// Network name, empty for the container's primary address.
    pub name: String,
    /// Container name, hostname and any aliases scoped to this network.
    pub domains: BTreeSet<String>,
}

/// Everything the hosts file needs to know about one running container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerRecord {
    pub id: String,
    pub networks: Vec<NetworkBinding>,
    /// Hostnames the reverse proxy routes for this container.
    pub proxy_claimed_hostnames: BTreeSet<String>,
    /// Whether this container is the reverse proxy itself.
    pub is_proxy: bool,
}

impl ContainerRecord {
    /// First binding with an assigned address.
    pub fn first_address(&self) -> Option<&str> {
        self.networks
            .iter()
            .map(|binding| binding.ip.as_str())
            .find(|ip| !ip.is_empty())
    }
}

/// Container lifecycle transitions the synchronizer reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Stop,
    Die,
    Destroy,
}

impl EventKind {
    /// Maps a Docker event action onto a kind, `None` for anything else.
    pub fn from_action(action: &str) -> Option<Self> {
        match action {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "die" => Some(Self::Die),
            "destroy" => Some(Self::Destroy),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Die => "die",
            Self::Destroy => "destroy",
        }
    }
}

/// A container lifecycle notification delivered by a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub id: String,
}

impl LifecycleEvent {
    pub fn new(kind: EventKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}
