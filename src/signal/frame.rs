//! Signal frame layout and construction.
//!
//! Mirrors the foreign ABI's `struct rt_sigframe` plus the FPU save area
//! that precedes it on the guest stack. The frame is what makes a handler
//! invocation look, from the guest program's perspective, exactly like a
//! real interrupt: a [`sigreturn`](super::controller::SignalController::sigreturn)
//! call unwinds it and resumes the interrupted instruction.

use super::types::{SigInfo, SigSet};

/// Saved general-purpose register state for the foreign ABI's 32-bit
/// calling convention. Field names match the foreign `sigcontext` so the
/// frame layout below reads the same as the wire format it reproduces.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MachineContext {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub eip: u32,
    pub eflags: u32,
    /// Guest address of the FPU save area, or `0` if none is in force.
    /// Mirrors `sigcontext.fpstate`; the other `sigcontext` fields the
    /// original always zero-fills (segment selectors, `trapno`, `err`,
    /// `cr2`) aren't modeled here since nothing ever reads them back.
    pub fpstate_ptr: u32,
}

/// Opaque 512-byte FPU/XMM save area, aligned as `fxsave`/`fxrstor` require.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FpuState(pub [u8; 512]);

impl Default for FpuState {
    fn default() -> Self {
        FpuState([0u8; 512])
    }
}

impl std::fmt::Debug for FpuState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FpuState").field("len", &self.0.len()).finish()
    }
}

/// `ucontext_t`'s relevant subset: the signal mask in force before delivery
/// plus the saved machine context.
#[derive(Debug, Clone, Copy, Default)]
pub struct UContext {
    pub flags: u32,
    pub link: u32,
    pub sigmask: SigSet,
    pub mcontext: MachineContext,
}

/// The complete on-stack signal frame built by
/// [`build_frame`] and consumed by [`restore_frame`].
///
/// This is host-side bookkeeping, not a literal byte-for-byte memory image;
/// the embedding emulator is responsible for actually writing it into guest
/// memory through [`crate::memory::GuestMemory`] at the address `build_frame`
/// chooses. Keeping it as a plain struct here (rather than serializing
/// eagerly) keeps the frame layout testable without a guest memory mock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalFrame {
    /// Address of the restorer trampoline (guest or emulator-provided).
    pub pretcode: u64,
    pub signo: u32,
    pub info: SigInfo,
    pub uc: UContext,
}

/// Compute the guest stack pointer the FPU save area should land at:
/// 512-byte aligned, downward from `sp`.
pub fn fpu_area_address(sp: u32) -> u32 {
    let lowered = sp.wrapping_sub(512);
    lowered & !511u32
}

/// Compute the guest stack pointer the signal frame itself should land at,
/// below the FPU save area, satisfying the foreign ABI's handler-entry
/// alignment rule: `(sp + 4) % 16 == 0`.
pub fn frame_address(fpu_area: u32, frame_size: u32) -> u32 {
    let lowered = fpu_area.wrapping_sub(frame_size);
    ((lowered.wrapping_add(4)) & !15u32).wrapping_sub(4)
}

/// Build the frame for delivering `info` against `context`, with `mask`
/// being the pre-delivery blocked set to save into `uc_sigmask`,
/// `restorer` the disposition's restorer address (`0` meaning "use the
/// emulator trampoline", which the caller substitutes before calling this),
/// and `fpu_area` the guest address the FPU state was (or will be) saved to.
pub fn build_frame(
    info: SigInfo,
    context: &MachineContext,
    mask: SigSet,
    restorer: u64,
    fpu_area: u32,
) -> SignalFrame {
    let mut mcontext = *context;
    mcontext.fpstate_ptr = fpu_area;
    SignalFrame {
        pretcode: restorer,
        signo: info.signo,
        info,
        uc: UContext {
            flags: 0,
            link: 0,
            sigmask: mask,
            mcontext,
        },
    }
}

/// Recover the pre-delivery mask and machine context from a frame read back
/// at `sigreturn` time. The mask restoration is what re-enables signals the
/// handler's disposition had blocked for its duration.
pub fn restore_frame(frame: &SignalFrame) -> (SigSet, MachineContext) {
    (frame.uc.sigmask, frame.uc.mcontext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fpu_area_is_512_aligned_and_below_sp() {
        let sp = 0x8000_1234u32;
        let area = fpu_area_address(sp);
        assert_eq!(area % 512, 0);
        assert!(area <= sp);
    }

    #[test]
    fn frame_address_satisfies_sp_plus_4_mod_16() {
        let fpu_area = fpu_area_address(0x8000_1234);
        let addr = frame_address(fpu_area, 128);
        assert_eq!((addr.wrapping_add(4)) % 16, 0);
        assert!(addr <= fpu_area);
    }

    #[test]
    fn build_and_restore_frame_round_trips_mask_and_context() {
        let mut mask = SigSet::EMPTY;
        mask.insert(4);
        let context = MachineContext {
            eip: 0x1000,
            esp: 0x2000,
            eax: 42,
            ..Default::default()
        };
        let info = SigInfo::simple(10);
        let frame = build_frame(info, &context, mask, 0xdead_beef, 0x1f00);
        assert_eq!(frame.pretcode, 0xdead_beef);
        assert_eq!(frame.signo, 10);
        assert_eq!(frame.uc.mcontext.fpstate_ptr, 0x1f00);

        let (restored_mask, restored_context) = restore_frame(&frame);
        assert_eq!(restored_mask, mask);
        assert_eq!(restored_context.eip, context.eip);
        assert_eq!(restored_context.esp, context.esp);
        assert_eq!(restored_context.eax, context.eax);
    }
}
