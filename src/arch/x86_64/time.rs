use crate::time::TimeArch;

#[derive(Debug, Clone, Copy)]
pub struct X86_64TimeArch;

impl TimeArch for X86_64TimeArch {
    /// 读取TSC
    #[inline(always)]
    fn get_cycles() -> usize {
        unsafe { x86::time::rdtsc() as usize }
    }
}
