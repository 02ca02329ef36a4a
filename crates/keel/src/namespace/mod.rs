//! Linux namespace configuration.
//!
//! Containers get fresh UTS, PID, mount, network and IPC namespaces. The
//! user namespace is shared with the host.

/// A namespace kind a container is isolated by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Hostname and domain name.
    Uts,
    /// Process ID space.
    Pid,
    /// Mount table.
    Mount,
    /// Network stack.
    Net,
    /// System V IPC and POSIX message queues.
    Ipc,
}

impl Namespace {
    /// Order in which `exec` joins a running container; mount is last.
    pub const JOIN_ORDER: [Self; 5] = [Self::Ipc, Self::Uts, Self::Net, Self::Pid, Self::Mount];

    /// Name of the namespace file under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Uts => "uts",
            Self::Pid => "pid",
            Self::Mount => "mnt",
            Self::Net => "net",
            Self::Ipc => "ipc",
        }
    }

    /// The `CLONE_NEW*` flag for this namespace.
    #[must_use]
    pub const fn clone_flag(self) -> libc::c_int {
        match self {
            Self::Uts => libc::CLONE_NEWUTS,
            Self::Pid => libc::CLONE_NEWPID,
            Self::Mount => libc::CLONE_NEWNS,
            Self::Net => libc::CLONE_NEWNET,
            Self::Ipc => libc::CLONE_NEWIPC,
        }
    }
}

/// Namespace configuration.
#[derive(Debug, Clone, Default)]
pub struct NamespaceConfig {
    /// PID namespace.
    pub pid: bool,
    /// Network namespace.
    pub net: bool,
    /// Mount namespace.
    pub mount: bool,
    /// UTS namespace.
    pub uts: bool,
    /// IPC namespace.
    pub ipc: bool,
}

impl NamespaceConfig {
    /// The namespaces every container is created with.
    #[must_use]
    pub const fn container() -> Self {
        Self {
            pid: true,
            net: true,
            mount: true,
            uts: true,
            ipc: true,
        }
    }

    /// Enabled namespaces.
    #[must_use]
    pub fn namespaces(&self) -> Vec<Namespace> {
        [
            (self.uts, Namespace::Uts),
            (self.pid, Namespace::Pid),
            (self.mount, Namespace::Mount),
            (self.net, Namespace::Net),
            (self.ipc, Namespace::Ipc),
        ]
        .into_iter()
        .filter_map(|(enabled, ns)| enabled.then_some(ns))
        .collect()
    }

    /// Combined flags for `clone(2)`.
    #[must_use]
    pub fn to_clone_flags(&self) -> libc::c_int {
        self.namespaces()
            .into_iter()
            .fold(0, |flags, ns| flags | ns.clone_flag())
    }
}
