//! Sender credentials attached by the kernel to received messages.

use bitflags::bitflags;
use kdbus_wire::abi::{
    ATTACH_AUDIT, ATTACH_CAPS, ATTACH_CGROUP, ATTACH_CMDLINE, ATTACH_COMM, ATTACH_CREDS,
    ATTACH_EXE, ATTACH_NAMES, ATTACH_SECLABEL,
};
use serde::{Deserialize, Serialize};

bitflags! {
    /// Credential fields an application asks for, and which of them a
    /// message actually carries.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct CredsMask: u64 {
        const PID = 1 << 0;
        const PID_STARTTIME = 1 << 1;
        const TID = 1 << 2;
        const UID = 1 << 3;
        const GID = 1 << 4;
        const COMM = 1 << 5;
        const TID_COMM = 1 << 6;
        const EXE = 1 << 7;
        const CMDLINE = 1 << 8;
        const CGROUP = 1 << 9;
        const UNIT = 1 << 10;
        const USER_UNIT = 1 << 11;
        const SLICE = 1 << 12;
        const SESSION = 1 << 13;
        const OWNER_UID = 1 << 14;
        const EFFECTIVE_CAPS = 1 << 15;
        const PERMITTED_CAPS = 1 << 16;
        const INHERITABLE_CAPS = 1 << 17;
        const BOUNDING_CAPS = 1 << 18;
        const SELINUX_CONTEXT = 1 << 19;
        const AUDIT_SESSION_ID = 1 << 20;
        const AUDIT_LOGIN_UID = 1 << 21;
        const UNIQUE_NAME = 1 << 22;
        const WELL_KNOWN_NAMES = 1 << 23;

        const PROCESS = Self::UID.bits() | Self::GID.bits() | Self::PID.bits()
            | Self::PID_STARTTIME.bits() | Self::TID.bits();
        const CGROUP_DERIVED = Self::CGROUP.bits() | Self::UNIT.bits()
            | Self::USER_UNIT.bits() | Self::SLICE.bits() | Self::SESSION.bits()
            | Self::OWNER_UID.bits();
        const CAPS = Self::EFFECTIVE_CAPS.bits() | Self::PERMITTED_CAPS.bits()
            | Self::INHERITABLE_CAPS.bits() | Self::BOUNDING_CAPS.bits();
        const AUDIT = Self::AUDIT_SESSION_ID.bits() | Self::AUDIT_LOGIN_UID.bits();
    }
}

impl CredsMask {
    /// Kernel `ATTACH_*` flags needed to receive these fields.
    pub fn attach_flags(self) -> u64 {
        const TABLE: &[(CredsMask, u64)] = &[
            (CredsMask::PROCESS, ATTACH_CREDS),
            (CredsMask::COMM.union(CredsMask::TID_COMM), ATTACH_COMM),
            (CredsMask::EXE, ATTACH_EXE),
            (CredsMask::CMDLINE, ATTACH_CMDLINE),
            (CredsMask::CGROUP_DERIVED, ATTACH_CGROUP),
            (CredsMask::CAPS, ATTACH_CAPS),
            (CredsMask::SELINUX_CONTEXT, ATTACH_SECLABEL),
            (CredsMask::AUDIT, ATTACH_AUDIT),
            (CredsMask::WELL_KNOWN_NAMES, ATTACH_NAMES),
        ];
        TABLE
            .iter()
            .filter(|(fields, _)| self.intersects(*fields))
            .fold(0, |acc, (_, flag)| acc | flag)
    }
}

/// Credentials record of a message. Only fields whose bit is in `mask` are
/// meaningful.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Creds {
    pub mask: CredsMask,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub tid: u32,
    /// Process start time in microseconds.
    pub pid_starttime: u64,
    pub comm: Option<String>,
    pub tid_comm: Option<String>,
    pub exe: Option<String>,
    /// NUL-separated argv.
    pub cmdline: Option<Vec<u8>>,
    pub cgroup: Option<String>,
    /// Raw capability sets.
    pub capability: Option<Vec<u8>>,
    pub seclabel: Option<String>,
    pub audit_session_id: u32,
    pub audit_login_uid: u32,
    pub unique_name: Option<String>,
    /// NUL-separated well-known names owned by the sender.
    pub well_known_names: Option<Vec<u8>>,
}

impl Default for Creds {
    fn default() -> Self {
        Self {
            mask: CredsMask::empty(),
            uid: 0,
            gid: 0,
            pid: 0,
            tid: 0,
            pid_starttime: 0,
            comm: None,
            tid_comm: None,
            exe: None,
            cmdline: None,
            cgroup: None,
            capability: None,
            seclabel: None,
            audit_session_id: 0,
            audit_login_uid: 0,
            unique_name: None,
            well_known_names: None,
        }
    }
}

impl Creds {
    pub fn has(&self, fields: CredsMask) -> bool {
        self.mask.contains(fields)
    }

    pub fn cmdline_args(&self) -> impl Iterator<Item = &[u8]> {
        split_nul(self.cmdline.as_deref())
    }

    pub fn well_known_names(&self) -> impl Iterator<Item = &str> {
        split_nul(self.well_known_names.as_deref()).filter_map(|name| std::str::from_utf8(name).ok())
    }

    /// Unit the sender runs in, e.g. `foo.service` or `session-2.scope`.
    pub fn unit(&self) -> Option<&str> {
        self.cgroup.as_deref().and_then(cgroup_unit)
    }

    /// Unit inside the sender's user manager, e.g. `app.service` under
    /// `user@1000.service`.
    pub fn user_unit(&self) -> Option<&str> {
        let cgroup = self.cgroup.as_deref()?;
        let mut rest = components(cgroup)
            .skip_while(|c| !(c.starts_with("user@") && c.ends_with(".service")))
            .skip(1)
            .skip_while(|c| c.ends_with(".slice"));
        rest.next().filter(|c| is_unit(c))
    }

    /// Innermost slice of the sender's cgroup; the root slice is `-.slice`.
    pub fn slice(&self) -> Option<&str> {
        self.cgroup.as_deref().map(cgroup_slice)
    }

    /// Login session id, when the sender runs in a session scope.
    pub fn session(&self) -> Option<&str> {
        self.unit()?
            .strip_prefix("session-")?
            .strip_suffix(".scope")
            .filter(|id| !id.is_empty())
    }

    /// Uid owning the sender's `user-<uid>.slice`.
    pub fn owner_uid(&self) -> Option<u32> {
        let cgroup = self.cgroup.as_deref()?;
        components(cgroup)
            .filter_map(|c| c.strip_prefix("user-")?.strip_suffix(".slice"))
            .find_map(|uid| uid.parse().ok())
    }
}

fn split_nul(bytes: Option<&[u8]>) -> impl Iterator<Item = &[u8]> {
    bytes
        .unwrap_or_default()
        .split(|&b| b == 0)
        .filter(|chunk| !chunk.is_empty())
}

fn components(cgroup: &str) -> impl Iterator<Item = &str> {
    cgroup.split('/').filter(|c| !c.is_empty())
}

const UNIT_SUFFIXES: &[&str] = &[
    ".service", ".scope", ".socket", ".mount", ".swap", ".timer", ".path", ".target", ".device",
];

fn is_unit(component: &str) -> bool {
    UNIT_SUFFIXES.iter().any(|suffix| component.ends_with(suffix))
}

fn cgroup_unit(cgroup: &str) -> Option<&str> {
    components(cgroup)
        .skip_while(|c| c.ends_with(".slice"))
        .next()
        .filter(|c| is_unit(c))
}

fn cgroup_slice(cgroup: &str) -> &str {
    components(cgroup)
        .take_while(|c| c.ends_with(".slice"))
        .last()
        .unwrap_or("-.slice")
}
