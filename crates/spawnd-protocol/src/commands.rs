//! Command tags of the wire protocol.

/// Declares a `u8`-tagged enum with lossless conversions from and to the
/// wire byte.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value, )+
        }

        impl $name {
            /// Decodes a wire byte, returning `None` for unknown tags.
            #[must_use]
            pub const fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $( $value => Some(Self::$variant), )+
                    _ => None,
                }
            }
        }

        impl From<$name> for u8 {
            fn from(command: $name) -> Self {
                command as Self
            }
        }
    };
}

wire_enum! {
    /// First byte of every request datagram.
    pub enum RequestCommand {
        /// Introduces a new connection; carries its socket.
        Connect = 0,
        /// Spawns a child process.
        Exec = 1,
        /// Sends signals to children.
        Kill = 2,
    }
}

wire_enum! {
    /// Tag of one record in a response datagram.
    pub enum ResponseCommand {
        /// An `EXEC` request finished; carries an error message or nothing.
        ExecComplete = 0,
        /// A child exited; carries the raw wait status.
        Exit = 1,
        /// The spawner's cgroup is close to its memory limit.
        MemoryWarning = 2,
        /// The spawner manages cgroups.
        CgroupsAvailable = 3,
    }
}

wire_enum! {
    /// Tag of one record in the body of an `EXEC` request.
    pub enum ExecCommand {
        /// `arg\0`
        Arg = 0,
        /// `NAME=value\0`
        SetEnv = 1,
        /// `path\0`
        ExecPath = 2,
        /// fd
        ExecFd = 3,
        /// `u16`
        Umask = 4,
        /// fd
        Stdin = 5,
        /// fd
        Stdout = 6,
        /// fd
        Stderr = 7,
        /// fd
        Control = 8,
        /// `path\0`
        StderrPath = 9,
        /// fd
        ReturnStderr = 10,
        /// fd
        ReturnPidfd = 11,
        /// fd
        ReturnCgroup = 12,
        /// flag
        Tty = 13,
        /// flag
        Session = 14,
        /// flag
        Journal = 15,
        /// flag
        UserNs = 16,
        /// flag
        MapRoot = 17,
        /// `u32`
        MappedUid = 18,
        /// flag
        PidNs = 19,
        /// `name\0`
        PidNsName = 20,
        /// flag
        CgroupNs = 21,
        /// flag
        NetworkNs = 22,
        /// `name\0`
        NetworkNsName = 23,
        /// flag
        IpcNs = 24,
        /// `hostname\0`
        Hostname = 25,
        /// flag
        MountNs = 26,
        /// `path\0`
        PivotRoot = 27,
        /// flag
        MountRootTmpfs = 28,
        /// flag
        MountProc = 29,
        /// flag
        WritableProc = 30,
        /// flag
        MountDev = 31,
        /// flag
        MountPts = 32,
        /// flag
        BindMountPts = 33,
        /// `options\0`
        MountTmpTmpfs = 34,
        /// `source\0 target\0 u8`
        BindMount = 35,
        /// `source\0 target\0 u8`
        BindMountFile = 36,
        /// fd, `target\0 u8`
        FdBindMount = 37,
        /// fd, `target\0 u8`
        FdBindMountFile = 38,
        /// `target\0 u8`
        MountTmpfs = 39,
        /// `name\0 target\0 u8`
        MountNamedTmpfs = 40,
        /// `path\0 contents\0`
        WriteFile = 41,
        /// `target\0 linkpath\0`
        Symlink = 42,
        /// `u8 resource, u64 soft, u64 hard`
        Rlimit = 43,
        /// `u32 uid, u32 gid, u32 real_uid, u32 real_gid, u8 n, n * u32`
        UidGid = 44,
        /// flag
        SchedIdle = 45,
        /// flag
        IoprioIdle = 46,
        /// `i32`
        Priority = 47,
        /// flag
        NoNewPrivs = 48,
        /// flag
        ForbidUserNs = 49,
        /// flag
        ForbidMulticast = 50,
        /// flag
        ForbidBind = 51,
        /// `name\0`
        Cgroup = 52,
        /// `session\0`
        CgroupSession = 53,
        /// `name\0 value\0`
        CgroupSet = 54,
        /// `name\0 value\0`
        CgroupXattr = 55,
        /// `path\0`
        Chroot = 56,
        /// `path\0`
        Chdir = 57,
        /// `data\0`
        HookInfo = 58,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip_through_u8() {
        for value in 0..=58 {
            let command = ExecCommand::from_u8(value).expect("dense tag range");
            assert_eq!(u8::from(command), value);
        }
        assert_eq!(ExecCommand::from_u8(59), None);
    }

    #[test]
    fn unknown_request_is_rejected() {
        assert_eq!(RequestCommand::from_u8(1), Some(RequestCommand::Exec));
        assert_eq!(RequestCommand::from_u8(3), None);
        assert_eq!(ResponseCommand::from_u8(4), None);
    }
}
