//! Wire format of the kdbus kernel transport.
//!
//! This crate is pure data layout; it performs no system calls:
//! * [`abi`] – item tags, sentinels, flags and fixed record sizes.
//! * [`ItemWriter`] – appends aligned items to a pre-sized [`KmsgBuf`].
//! * [`KmsgView`] / [`Item`] – zero-copy decoding of kernel records.
//! * [`HelloCmd`] / [`MakeCmd`] – control command buffers.
//! * [`BloomFilter`] – broadcast match filter.
//! * [`parse_unique_name`] / [`format_unique_name`] – `":1.<id>"` names.

pub mod abi;
mod bloom;
mod buf;
mod cmd;
mod error;
mod names;
mod reader;
mod writer;

pub use bloom::{prefixes, BloomFilter};
pub use buf::KmsgBuf;
pub use cmd::{
    HelloCmd, HelloReply, MakeCmd, MakeKind, BUS_MAKE_FIXED_SIZE, HELLO_FIXED_SIZE,
    NS_MAKE_FIXED_SIZE,
};
pub use error::{WireError, WireResult};
pub use names::{format_unique_name, parse_unique_name, UNIQUE_NAME_PREFIX};
pub use reader::{c_str, read_u64, FdList, IdChange, Item, ItemIter, KmsgView, NameChange, RawItem};
pub use writer::{ItemAudit, ItemCreds, ItemTimestamp, ItemWriter, KmsgHeader};
