//! Reading the current program counter.
//!
//! Software cannot name the program counter on most architectures, so each supported target
//! gets its own way of materializing it. The implementation is selected at build time through
//! [`HostArch`].

/// The "get current call frame" capability.
pub trait CurrentFrame {
    /// Returns an address inside the calling function, or [`None`] when the architecture
    /// offers no way to read it.
    fn program_counter() -> Option<usize>;
}

#[cfg(target_arch = "x86_64")]
pub struct X86_64;

#[cfg(target_arch = "x86_64")]
impl CurrentFrame for X86_64 {
    #[inline(always)]
    fn program_counter() -> Option<usize> {
        let pc: usize;
        unsafe {
            std::arch::asm!(
                "lea {}, [rip]",
                out(reg) pc,
                options(nomem, nostack, preserves_flags)
            );
        }
        Some(pc)
    }
}

#[cfg(target_arch = "aarch64")]
pub struct Aarch64;

#[cfg(target_arch = "aarch64")]
impl CurrentFrame for Aarch64 {
    #[inline(always)]
    fn program_counter() -> Option<usize> {
        let pc: usize;
        unsafe {
            std::arch::asm!(
                "adr {}, .",
                out(reg) pc,
                options(nomem, nostack, preserves_flags)
            );
        }
        Some(pc)
    }
}

/// Targets without a program counter read; the capturer falls back to skipping frames.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub struct Generic;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
impl CurrentFrame for Generic {
    #[inline(always)]
    fn program_counter() -> Option<usize> {
        None
    }
}

#[cfg(target_arch = "x86_64")]
pub type HostArch = X86_64;

#[cfg(target_arch = "aarch64")]
pub type HostArch = Aarch64;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub type HostArch = Generic;
