//! Domain events published on the shared [`EventQueue`]
//!
//! Every event carries the id of the server it concerns so subscribers can
//! correlate it with the matching status stream.

pub mod queue;

pub use queue::EventQueue;

/// A server entry was created from an access key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAdded {
    pub server_id: String,
    pub name: String,
}

/// The access key was already known; no entry was created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAlreadyAdded {
    pub server_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerForgotten {
    pub server_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerForgetUndone {
    pub server_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRenamed {
    pub server_id: String,
    pub name: String,
}

/// The tunnel is up, either after `connect` or at the end of a
/// reconnection episode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConnected {
    pub server_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDisconnected {
    pub server_id: String,
}

/// A reconnection episode started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReconnecting {
    pub server_id: String,
}
