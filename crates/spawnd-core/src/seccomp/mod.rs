//! Seccomp-BPF program assembly and installation.
//!
//! A program is a list of self-contained rule blocks behind an
//! architecture check:
//!
//! ```text
//! ld arch; jeq NATIVE,1,0; ret KILL     foreign architectures die
//! ld nr
//! jeq NR,0,1; ret ACTION                plain rule
//! jeq NR,0,2k+2; { ld arg; jxx } * k; ret ACTION; ld nr
//! ret ALLOW
//! ```
//!
//! Rules with argument checks reload the syscall number at their end, so
//! blocks can be appended in any order without computing long jumps.

pub mod filter;

use std::io;

pub use self::filter::SyscallFilter;

const SECCOMP_SET_MODE_FILTER: libc::c_uint = 1;

const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JEQ: u16 = 0x10;
#[cfg(target_arch = "x86_64")]
const BPF_JGE: u16 = 0x30;
const BPF_JSET: u16 = 0x40;
const BPF_K: u16 = 0x00;

const OFFSET_SYSCALL_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;
const OFFSET_ARGS: u32 = 16;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH_NATIVE: u32 = 0xc000_003e;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH_NATIVE: u32 = 0xc000_00b7;

/// x32 ABI syscalls share the x86_64 audit architecture.
#[cfg(target_arch = "x86_64")]
const X32_SYSCALL_BIT: u32 = 0x4000_0000;

/// One classic BPF instruction, laid out like `struct sock_filter`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SockFilter {
    /// Opcode.
    pub code: u16,
    /// Jump offset if true.
    pub jt: u8,
    /// Jump offset if false.
    pub jf: u8,
    /// Operand.
    pub k: u32,
}

impl SockFilter {
    const fn stmt(code: u16, k: u32) -> Self {
        Self { code, jt: 0, jf: 0, k }
    }

    const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }

    const fn load(offset: u32) -> Self {
        Self::stmt(BPF_LD | BPF_W | BPF_ABS, offset)
    }

    const fn ret(value: u32) -> Self {
        Self::stmt(BPF_RET | BPF_K, value)
    }
}

#[repr(C)]
struct SockFprog {
    len: libc::c_ushort,
    filter: *const SockFilter,
}

/// What happens when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Kill the whole process with `SIGSYS`.
    KillProcess,
    /// Fail the syscall with this errno.
    Errno(u16),
}

impl Action {
    const fn value(self) -> u32 {
        match self {
            Self::KillProcess => SECCOMP_RET_KILL_PROCESS,
            Self::Errno(errno) => SECCOMP_RET_ERRNO | errno as u32,
        }
    }
}

/// A condition on one syscall argument (its low 32 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgCheck {
    /// Argument equals `value`.
    Equal {
        /// Argument index, 0-5.
        index: u8,
        /// Expected value.
        value: u32,
    },
    /// Argument has any bit of `mask` set.
    AnyBits {
        /// Argument index, 0-5.
        index: u8,
        /// Bit mask.
        mask: u32,
    },
}

impl ArgCheck {
    const fn index(self) -> u8 {
        match self {
            Self::Equal { index, .. } | Self::AnyBits { index, .. } => index,
        }
    }

    const fn jump(self, skip: u8) -> SockFilter {
        match self {
            Self::Equal { value, .. } => SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, value, 0, skip),
            Self::AnyBits { mask, .. } => SockFilter::jump(BPF_JMP | BPF_JSET | BPF_K, mask, 0, skip),
        }
    }
}

/// Matches a syscall (optionally with argument conditions) to an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    syscall: libc::c_long,
    checks: Vec<ArgCheck>,
    action: Action,
}

impl Rule {
    /// Matches every call of `syscall`.
    #[must_use]
    pub const fn new(syscall: libc::c_long, action: Action) -> Self {
        Self {
            syscall,
            checks: Vec::new(),
            action,
        }
    }

    /// Additionally requires `check` to hold.
    #[must_use]
    pub fn with(mut self, check: ArgCheck) -> Self {
        self.checks.push(check);
        self
    }

    fn assemble(&self, out: &mut Vec<SockFilter>) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let nr = self.syscall as u32;
        let action = SockFilter::ret(self.action.value());
        if self.checks.is_empty() {
            out.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, nr, 0, 1));
            out.push(action);
            return;
        }

        let count = self.checks.len();
        #[allow(clippy::cast_possible_truncation)]
        out.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, nr, 0, (2 * count + 2) as u8));
        for (i, check) in self.checks.iter().enumerate() {
            out.push(SockFilter::load(OFFSET_ARGS + 8 * u32::from(check.index())));
            #[allow(clippy::cast_possible_truncation)]
            out.push(check.jump((2 * (count - i - 1) + 1) as u8));
        }
        out.push(action);
        out.push(SockFilter::load(OFFSET_SYSCALL_NR));
    }
}

/// Collects rules into a [`SeccompProgram`].
#[derive(Debug, Default)]
pub struct FilterBuilder {
    rules: Vec<Rule>,
}

impl FilterBuilder {
    /// Creates an empty builder; its program allows everything.
    #[must_use]
    pub const fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Appends a rule.
    pub fn add(&mut self, rule: Rule) -> &mut Self {
        self.rules.push(rule);
        self
    }

    /// Assembles the program.
    #[must_use]
    pub fn build(&self) -> SeccompProgram {
        let mut instructions = vec![
            SockFilter::load(OFFSET_ARCH),
            SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_NATIVE, 1, 0),
            SockFilter::ret(SECCOMP_RET_KILL_PROCESS),
            SockFilter::load(OFFSET_SYSCALL_NR),
        ];
        #[cfg(target_arch = "x86_64")]
        {
            instructions.push(SockFilter::jump(BPF_JMP | BPF_JGE | BPF_K, X32_SYSCALL_BIT, 0, 1));
            instructions.push(SockFilter::ret(SECCOMP_RET_KILL_PROCESS));
        }
        for rule in &self.rules {
            rule.assemble(&mut instructions);
        }
        instructions.push(SockFilter::ret(SECCOMP_RET_ALLOW));
        SeccompProgram { instructions }
    }
}

/// An assembled filter, ready to be installed in a child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeccompProgram {
    instructions: Vec<SockFilter>,
}

impl SeccompProgram {
    /// The BPF instructions.
    #[must_use]
    pub fn instructions(&self) -> &[SockFilter] {
        &self.instructions
    }

    /// Installs the filter on the calling thread. Does not allocate.
    ///
    /// Requires `PR_SET_NO_NEW_PRIVS` or `CAP_SYS_ADMIN`.
    ///
    /// # Errors
    ///
    /// Returns the OS error if `seccomp(2)` fails.
    pub fn install(&self) -> io::Result<()> {
        let len = libc::c_ushort::try_from(self.instructions.len())
            .map_err(|_| io::Error::from_raw_os_error(libc::E2BIG))?;
        let program = SockFprog {
            len,
            filter: self.instructions.as_ptr(),
        };
        // SAFETY: program points to `len` valid instructions that outlive
        // the call; the kernel copies them.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                0 as libc::c_uint,
                &raw const program,
            )
        };
        if ret != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_program_checks_arch_and_allows() {
        let program = FilterBuilder::new().build();
        let instructions = program.instructions();
        assert_eq!(instructions.first(), Some(&SockFilter::load(OFFSET_ARCH)));
        assert_eq!(instructions.get(1).map(|i| i.k), Some(AUDIT_ARCH_NATIVE));
        assert_eq!(instructions.last(), Some(&SockFilter::ret(SECCOMP_RET_ALLOW)));
    }

    #[test]
    fn plain_rule_is_two_instructions() {
        let mut out = Vec::new();
        Rule::new(libc::SYS_acct, Action::KillProcess).assemble(&mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].jf, 1);
        assert_eq!(out[1].k, SECCOMP_RET_KILL_PROCESS);
    }

    #[test]
    fn argument_rule_jumps_land_on_reload() {
        let mut out = Vec::new();
        Rule::new(libc::SYS_setsockopt, Action::Errno(1))
            .with(ArgCheck::Equal { index: 1, value: 0 })
            .with(ArgCheck::Equal { index: 2, value: 35 })
            .assemble(&mut out);
        // jeq nr; ld a1; jeq; ld a2; jeq; ret; ld nr
        assert_eq!(out.len(), 7);
        let last = out.len() - 1;
        assert_eq!(out[0].jf as usize, last);
        assert_eq!(2 + out[2].jf as usize + 1, last);
        assert_eq!(4 + out[4].jf as usize + 1, last);
        assert_eq!(out[1].k, OFFSET_ARGS + 8);
        assert_eq!(out[3].k, OFFSET_ARGS + 16);
        assert_eq!(out[5].k, SECCOMP_RET_ERRNO | 1);
        assert_eq!(out[last], SockFilter::load(OFFSET_SYSCALL_NR));
    }

    #[test]
    fn errno_action_encoding() {
        assert_eq!(Action::Errno(38).value(), 0x0005_0026);
    }
}
