use thiserror::Error;

use crate::Addr;

/// Errors returned by the simulated network.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// The address is already bound.
    #[error("address {0} already in use")]
    AddressInUse(Addr),

    /// Nothing listens at the address.
    #[error("address {0} is unreachable")]
    Unreachable(Addr),

    /// The server at the address has no such service.
    #[error("no service {service} at {addr}")]
    ServiceNotRegistered {
        /// Destination.
        addr: Addr,
        /// Service requested.
        service: &'static str,
    },

    /// The service's mailbox was dropped.
    #[error("service {service} at {addr} is closed")]
    ServiceClosed {
        /// Destination.
        addr: Addr,
        /// Service requested.
        service: &'static str,
    },

    /// The network was stopped.
    #[error("network is stopped")]
    Stopped,

    /// No reply arrived within the deadline.
    #[error("request to {service} at {addr} timed out")]
    Timeout {
        /// Destination.
        addr: Addr,
        /// Service requested.
        service: &'static str,
    },

    /// The recipient dropped the request without replying.
    #[error("{service} at {addr} dropped the request")]
    NoResponse {
        /// Destination.
        addr: Addr,
        /// Service requested.
        service: &'static str,
    },
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
