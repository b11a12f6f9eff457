use crate::smp::cpu::ProcessorId;

pub mod capability;

/// 获取当前处理器的id
///
/// 以local APIC的初始ID作为pCPU id；BSP固定为0。
#[inline(always)]
pub fn arch_current_cpu_id() -> ProcessorId {
    #[cfg(target_os = "none")]
    {
        let cpuid = raw_cpuid::CpuId::new();
        let apic_id = cpuid
            .get_feature_info()
            .map(|f| f.initial_local_apic_id())
            .unwrap_or(0);
        return ProcessorId::new(apic_id as u32);
    }
    #[cfg(not(target_os = "none"))]
    {
        return ProcessorId::new(0);
    }
}

/// 停机。不可恢复的错误处理路径的终点
///
/// ## Safety
///
/// 调用后当前CPU不再返回，持有的锁和未完成的应答都会悬着
pub unsafe fn halt_forever() -> ! {
    #[cfg(target_os = "none")]
    {
        loop {
            x86::irq::disable();
            x86::halt();
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        panic!("halt_forever called on a hosted target");
    }
}
