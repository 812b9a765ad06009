//! User-visible error taxonomy

use std::fmt;

/// Errors surfaced across the public API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument.
    Inval,
    /// Out of memory.
    Nomem,
    /// No such node.
    Noent,
    /// Node already exists.
    Exist,
    /// Internal error.
    Internal,
    /// Could not resolve hostname.
    Resolv,
    /// Storage error.
    Storage,
    /// Network error.
    Network,
    /// Error communicating with peer.
    Peer,
    /// Operation not supported.
    Notsup,
    /// Instance already in use.
    Busy,
    /// Node is blacklisted.
    Blacklisted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Inval => "Invalid argument",
            Self::Nomem => "Out of memory",
            Self::Noent => "No such node",
            Self::Exist => "Node already exists",
            Self::Internal => "Internal error",
            Self::Resolv => "Could not resolve hostname",
            Self::Storage => "Storage error",
            Self::Network => "Network error",
            Self::Peer => "Error communicating with peer",
            Self::Notsup => "Operation not supported",
            Self::Busy => "Instance already in use",
            Self::Blacklisted => "Node is blacklisted",
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(Error::Noent.to_string(), "No such node");
        assert_eq!(Error::Busy.to_string(), "Instance already in use");
    }
}
