//! Bus administration: creating buses, activators and namespaces.
//!
//! Each command carries a single name item sized exactly to the name. The
//! upper 32 bits of every flag word the kernel returns are reserved for
//! incompatible features and must be zero.

use std::os::fd::OwnedFd;
use std::path::PathBuf;

use kdbus_wire::abi::{
    COMPAT_FLAGS_MASK, HELLO_STARTER, MAKE_ACCESS_WORLD, MAKE_POLICY_OPEN, POOL_SIZE,
};
use kdbus_wire::{HelloCmd, MakeCmd};

use crate::connection::check_hello;
use crate::error::{BusError, BusResult};
use crate::kernel::{ControlDevice, Kernel};

pub const CONTROL_PATH: &str = "/dev/kdbus/control";

/// Device node of the bus `name` created by `uid`.
pub fn bus_path(uid: u32, name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/kdbus/{uid}-{name}/bus"))
}

pub fn namespace_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/kdbus/ns/{name}"))
}

/// A bus or namespace; it exists as long as `handle` stays open.
#[derive(Debug)]
pub struct Created {
    pub handle: OwnedFd,
    pub path: PathBuf,
}

/// Creates the bus `"<uid>-<name>"`.
pub fn create_bus<C: ControlDevice + ?Sized>(control: &C, name: &str) -> BusResult<Created> {
    let uid = control.uid();
    let mut cmd = MakeCmd::bus(&format!("{uid}-{name}"), MAKE_POLICY_OPEN);
    let handle = control.bus_make(&mut cmd)?;
    if cmd.flags() > COMPAT_FLAGS_MASK {
        return Err(BusError::Unsupported("incompatible bus flags"));
    }
    let path = bus_path(uid, name);
    log::debug!("created bus {}", path.display());
    Ok(Created { handle, path })
}

/// Registers an activator holding `name` on the bus `bus` until the real
/// service connects. The activator lives as long as the returned endpoint.
pub fn create_starter<C: ControlDevice + ?Sized>(
    control: &C,
    bus: &str,
    name: &str,
) -> BusResult<C::Endpoint> {
    let endpoint = control.open(&bus_path(control.uid(), bus))?;
    let mut cmd = HelloCmd::starter(HELLO_STARTER, POOL_SIZE, name);
    endpoint.hello(&mut cmd)?;
    check_hello(&cmd.reply())?;
    log::debug!("registered activator for {name} on {bus}");
    Ok(endpoint)
}

pub fn create_namespace<C: ControlDevice + ?Sized>(control: &C, name: &str) -> BusResult<Created> {
    let mut cmd = MakeCmd::namespace(name, MAKE_POLICY_OPEN | MAKE_ACCESS_WORLD);
    let handle = control.ns_make(&mut cmd)?;
    if cmd.flags() > COMPAT_FLAGS_MASK {
        return Err(BusError::Unsupported("incompatible namespace flags"));
    }
    Ok(Created {
        handle,
        path: namespace_path(name),
    })
}
