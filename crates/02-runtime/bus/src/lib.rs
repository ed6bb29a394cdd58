//! D-Bus messages over the kdbus kernel transport.
//!
//! A [`Connection`] turns sealed [`Message`]s into kernel buffers on
//! [`Connection::send`] and turns kernel buffers read from its receive
//! [`Pool`] back into messages on [`Connection::read`]. Kernel notifications
//! about peers, names and failed calls arrive as synthetic messages from the
//! bus service. Large payloads travel in memfd segments recycled through a
//! bounded [`SegmentCache`].
//!
//! All kernel access goes through [`Kernel`] and [`ControlDevice`];
//! [`DevKdbus`] implements them over `/dev/kdbus`.

pub mod admin;
mod config;
mod connection;
mod dev;
mod error;
mod kernel;
mod memfd;
pub mod message;
mod notify;
mod pool;
mod receive;
mod segment_cache;
mod transcode;

pub use admin::{bus_path, create_bus, create_namespace, create_starter, namespace_path, Created};
pub use config::{ConnectionConfig, RequestNameFlags, SegmentCacheConfig};
pub use connection::{Connection, Sent};
pub use dev::{DevKdbus, KdbusEndpoint};
pub use error::{BusError, BusResult};
pub use kernel::{ControlDevice, Kernel};
pub use memfd::Mapping;
pub use message::{
    part_bytes, BodyPart, Creds, CredsMask, Cursor, HeaderFlags, Message, MessageType, NoPool,
    PartSource, Timestamps, Value,
};
pub use notify::{translate as translate_notification, Notification};
pub use pool::{Pool, PoolLease, PoolSpan};
pub use receive::Received;
pub use segment_cache::{Released, Segment, SegmentCache};
pub use transcode::{bloom_for, destination_of, prepare, Destination, BLOOM_MAX_ARGS};
