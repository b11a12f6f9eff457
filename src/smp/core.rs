use crate::smp::cpu::ProcessorId;

/// 获取当前处理器的id
#[inline(always)]
pub fn smp_get_processor_id() -> ProcessorId {
    #[cfg(test)]
    {
        if let Some(id) = tests::test_processor_id() {
            return id;
        }
    }
    return crate::arch::cpu::arch_current_cpu_id();
}
