//! Request routing.
//!
//! A [`DistSender`] turns a batch addressed by key into a batch addressed to
//! a range, then walks that range's replicas through a [`Transport`] until
//! one of them serves it. Range lookups go through a pluggable
//! [`RangeDescriptorDb`] and replicas are reached through a pluggable
//! [`TransportFactory`], which is how tests substitute their own routing.
//! [`Db`] is the typed client on top.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod db;
mod dist_sender;
mod range_descriptor_db;
mod sender;
mod transport;

pub use db::Db;
pub use dist_sender::{DistSender, DistSenderConfig};
pub use range_descriptor_db::RangeDescriptorDb;
pub use sender::Sender;
pub use transport::{
    BatchCall, ReplicaSlice, SendOptions, Transport, TransportFactory, sender_transport_factory,
};
