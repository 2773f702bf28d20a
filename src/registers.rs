//! Decomposition of a captured context into the wire's fixed register
//! layout.

use crate::host::{CtxReg, HostContext};
use crate::protocol::RegisterSet;

use CtxReg::*;

/// Break a saved context down into the register record the client reads.
/// The same decomposition serves ordinary and engine-internal (physical)
/// captures; the caller decides which capture to hand in.
pub fn from_context(ctx: &HostContext) -> RegisterSet {
    RegisterSet {
        eax: ctx.get(Gax),
        ebx: ctx.get(Gbx),
        ecx: ctx.get(Gcx),
        edx: ctx.get(Gdx),
        esi: ctx.get(Gsi),
        edi: ctx.get(Gdi),
        ebp: ctx.get(Gbp),
        esp: ctx.get(StackPtr),
        eip: ctx.get(InstPtr),
        r8: ctx.get(R8),
        r9: ctx.get(R9),
        r10: ctx.get(R10),
        r11: ctx.get(R11),
        r12: ctx.get(R12),
        r13: ctx.get(R13),
        r14: ctx.get(R14),
        r15: ctx.get(R15),
        eflags: ctx.get(Flags),
        cs: ctx.get(SegCs),
        ds: ctx.get(SegDs),
        es: ctx.get(SegEs),
        fs: ctx.get(SegFs),
        gs: ctx.get(SegGs),
        ss: ctx.get(SegSs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BADADDR;

    #[test]
    fn decomposition_covers_gp_ip_flags_and_selectors() {
        let mut ctx = HostContext::new();
        ctx.set(Gax, 1)
            .set(StackPtr, 0x7fff_0000)
            .set(InstPtr, 0x401000)
            .set(Flags, 0x246)
            .set(SegCs, 0x33)
            .set(R15, 99);
        let regs = from_context(&ctx);
        assert_eq!({ regs.eax }, 1);
        assert_eq!({ regs.esp }, 0x7fff_0000);
        assert_eq!({ regs.eip }, 0x401000);
        assert_eq!({ regs.eflags }, 0x246);
        assert_eq!({ regs.cs }, 0x33);
        assert_eq!({ regs.r15 }, 99);
        // untouched registers stay undefined
        assert_eq!({ regs.ebx }, BADADDR);
    }
}
