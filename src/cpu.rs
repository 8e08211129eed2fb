//! Register snapshot layouts for the two supported instruction sets.
//!
//! Two fixed layouts exist side by side: the DBI engine's state blocks
//! ([`GprState`], [`FprState`]) and the raw context the inline-hook
//! trampoline spills on function entry ([`HookRegisterContext`]). They are
//! bridged positionally in `regs_bridge`; register counts are build-time
//! facts, never runtime checks.

/// Number of plain general-purpose registers (excluding fp/lr/sp/pc).
#[cfg(not(target_arch = "arm"))]
pub const GPR_COUNT: usize = 29;
#[cfg(target_arch = "arm")]
pub const GPR_COUNT: usize = 13;

/// 128-bit vector registers on the 64-bit instruction set.
#[cfg(not(target_arch = "arm"))]
pub const VECTOR_COUNT: usize = 32;

/// How many arguments the procedure-call standard passes in registers.
#[cfg(not(target_arch = "arm"))]
pub const ARG_REGISTER_COUNT: usize = 8;
#[cfg(target_arch = "arm")]
pub const ARG_REGISTER_COUNT: usize = 4;

/// General-purpose register state as the DBI engine exposes it.
#[cfg(not(target_arch = "arm"))]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GprState {
    pub x: [u64; GPR_COUNT],
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    pub nzcv: u64,
    pub pc: u64,
}

#[cfg(not(target_arch = "arm"))]
impl GprState {
    pub fn ip(&self) -> u64 {
        self.pc
    }

    pub fn argument(&self, n: usize) -> u64 {
        self.x[n]
    }

    /// x8 carries the supervisor-call number.
    pub fn syscall_nr(&self) -> u64 {
        self.x[8]
    }

    pub fn return_value(&self) -> u64 {
        self.x[0]
    }

    /// Point sp and fp into a replacement stack. `top` is the highest usable
    /// address; sp must stay 16-byte aligned.
    pub fn redirect_stack(&mut self, top: u64) {
        self.sp = top & !0xf;
        self.fp = self.sp;
    }
}

/// Floating/vector register state as the DBI engine exposes it.
#[cfg(not(target_arch = "arm"))]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FprState {
    pub v: [[u8; 16]; VECTOR_COUNT],
    pub fpcr: u32,
    pub fpsr: u32,
}

/// Raw register context the inline-hook trampoline spills on entry.
/// Field order matches the trampoline's push sequence, not `GprState`.
#[cfg(not(target_arch = "arm"))]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HookRegisterContext {
    pub sp: u64,
    pub lr: u64,
    pub fp: u64,
    pub pc: u64,
    pub nzcv: u64,
    pub general: [u64; GPR_COUNT],
    pub vectors: [[u8; 16]; VECTOR_COUNT],
}

#[cfg(not(target_arch = "arm"))]
impl HookRegisterContext {
    pub fn argument(&self, n: usize) -> u64 {
        self.general[n]
    }

    pub fn return_value(&self) -> u64 {
        self.general[0]
    }
}

/// General-purpose register state as the DBI engine exposes it.
#[cfg(target_arch = "arm")]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GprState {
    pub r: [u32; GPR_COUNT],
    pub sp: u32,
    pub lr: u32,
    pub pc: u32,
    pub cpsr: u32,
}

#[cfg(target_arch = "arm")]
impl GprState {
    pub fn ip(&self) -> u64 {
        u64::from(self.pc)
    }

    pub fn argument(&self, n: usize) -> u64 {
        u64::from(self.r[n])
    }

    /// r7 carries the supervisor-call number (EABI).
    pub fn syscall_nr(&self) -> u64 {
        u64::from(self.r[7])
    }

    pub fn return_value(&self) -> u64 {
        u64::from(self.r[0])
    }

    pub fn redirect_stack(&mut self, top: u64) {
        self.sp = (top as u32) & !0x7;
        // r11 doubles as the frame pointer in ARM mode
        self.r[11] = self.sp;
    }
}

/// VFP double bank. The inline-hook context never exposes these on this
/// instruction set, so only the engine-side snapshot carries them.
#[cfg(target_arch = "arm")]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FprState {
    pub d: [u64; 16],
    pub fpscr: u32,
}

/// Raw register context the inline-hook trampoline spills on entry.
/// No floating/vector bank exists here; see `regs_bridge` for the
/// consequences.
#[cfg(target_arch = "arm")]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HookRegisterContext {
    pub sp: u32,
    pub lr: u32,
    pub pc: u32,
    pub cpsr: u32,
    pub general: [u32; GPR_COUNT],
}

#[cfg(target_arch = "arm")]
impl HookRegisterContext {
    pub fn argument(&self, n: usize) -> u64 {
        u64::from(self.general[n])
    }

    pub fn return_value(&self) -> u64 {
        u64::from(self.general[0])
    }
}

/// One full CPU snapshot, taken before and after every traced instruction.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CpuStatus {
    pub gpr: GprState,
    pub fpr: FprState,
}
