//! Integration tests for the kdbus translation layer.
//!
//! [`loopback`] simulates the kernel side in-process so that whole
//! send/receive paths run without `/dev/kdbus`.

pub mod loopback;

pub use loopback::{
    memfd, HelloOverrides, LoopbackBus, LoopbackControl, LoopbackEndpoint, Stats, BUS_ID, COMM,
};






#[cfg(test)]
mod segments;
