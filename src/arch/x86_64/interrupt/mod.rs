use crate::config::MAX_VM_NUM;
use crate::exception::{HardwareIrqNumber, InterruptArch, IrqFlags, IrqFlagsGuard, IrqNumber};

pub mod ipi;
pub mod trap;

/// 中断线总数
pub const NR_IRQS: u32 = 256;

/// 动态分配的向量区间
pub const VECTOR_DYNAMIC_START: HardwareIrqNumber = HardwareIrqNumber::new(0x20);
pub const VECTOR_DYNAMIC_END: HardwareIrqNumber = HardwareIrqNumber::new(0xDF);
/// 静态保留的向量区间
pub const VECTOR_FIXED_START: HardwareIrqNumber = HardwareIrqNumber::new(0xE0);
pub const VECTOR_FIXED_END: HardwareIrqNumber = HardwareIrqNumber::new(0xFF);

/// 本地定时器
pub const VECTOR_TIMER: HardwareIrqNumber = HardwareIrqNumber::new(0xE0);
/// SMP call / vCPU notify
pub const VECTOR_NOTIFY_VCPU: HardwareIrqNumber = HardwareIrqNumber::new(0xE1);
/// PMU LVT
pub const VECTOR_PMI: HardwareIrqNumber = HardwareIrqNumber::new(0xE2);
/// 温度LVT
pub const VECTOR_THERMAL: HardwareIrqNumber = HardwareIrqNumber::new(0xE3);
/// CMCI
pub const VECTOR_CMCI: HardwareIrqNumber = HardwareIrqNumber::new(0xE4);
/// posted-interrupt通知向量的起点，每个VM槽位一个
pub const POSTED_INTR_VECTOR_BASE: HardwareIrqNumber = HardwareIrqNumber::new(0xE5);

pub const TIMER_IRQ: IrqNumber = IrqNumber::new(NR_IRQS - 1);
pub const NOTIFY_VCPU_IRQ: IrqNumber = IrqNumber::new(NR_IRQS - 2);
pub const PMI_IRQ: IrqNumber = IrqNumber::new(NR_IRQS - 3);
pub const THERMAL_IRQ: IrqNumber = IrqNumber::new(NR_IRQS - 4);
pub const CMCI_IRQ: IrqNumber = IrqNumber::new(NR_IRQS - 5);
/// posted-interrupt中断号的起点：VM槽位i使用`POSTED_INTR_IRQ_BASE + i`
pub const POSTED_INTR_IRQ_BASE: IrqNumber =
    IrqNumber::new(NR_IRQS - 5 - MAX_VM_NUM as u32);

/// 固定映射表中VM无关的行数
pub const NR_STATIC_MAPPINGS_1: usize = 5;
/// 固定映射表的总行数
pub const NR_STATIC_MAPPINGS: usize = NR_STATIC_MAPPINGS_1 + MAX_VM_NUM;

/// 启动期安装的静态IRQ<->向量映射
pub fn irq_static_mappings() -> [(IrqNumber, HardwareIrqNumber); NR_STATIC_MAPPINGS] {
    let mut mappings = [(IrqNumber::INVALID, HardwareIrqNumber::INVALID); NR_STATIC_MAPPINGS];
    mappings[0] = (TIMER_IRQ, VECTOR_TIMER);
    mappings[1] = (NOTIFY_VCPU_IRQ, VECTOR_NOTIFY_VCPU);
    mappings[2] = (PMI_IRQ, VECTOR_PMI);
    mappings[3] = (THERMAL_IRQ, VECTOR_THERMAL);
    mappings[4] = (CMCI_IRQ, VECTOR_CMCI);
    let mut i = 0;
    while i < MAX_VM_NUM {
        mappings[NR_STATIC_MAPPINGS_1 + i] = (
            POSTED_INTR_IRQ_BASE + i as u32,
            POSTED_INTR_VECTOR_BASE + i as u32,
        );
        i += 1;
    }
    return mappings;
}

/// 宿主机构建（单元测试）里用一个布尔值模拟IF标志
#[cfg(not(target_os = "none"))]
static FAKE_IF: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(true);

/// x86_64的中断架构实现
pub struct X86_64InterruptArch;

impl InterruptArch for X86_64InterruptArch {
    unsafe fn interrupt_enable() {
        #[cfg(target_os = "none")]
        x86::irq::enable();
        #[cfg(not(target_os = "none"))]
        FAKE_IF.store(true, core::sync::atomic::Ordering::Release);
    }

    unsafe fn interrupt_disable() {
        #[cfg(target_os = "none")]
        x86::irq::disable();
        #[cfg(not(target_os = "none"))]
        FAKE_IF.store(false, core::sync::atomic::Ordering::Release);
    }

    fn is_irq_enabled() -> bool {
        #[cfg(target_os = "none")]
        {
            return x86::bits64::rflags::read().contains(x86::bits64::rflags::RFlags::FLAGS_IF);
        }
        #[cfg(not(target_os = "none"))]
        {
            return FAKE_IF.load(core::sync::atomic::Ordering::Acquire);
        }
    }

    unsafe fn save_and_disable_irq() -> IrqFlagsGuard {
        let enabled = Self::is_irq_enabled();
        Self::interrupt_disable();
        return IrqFlagsGuard::new(IrqFlags::new(enabled as usize));
    }

    unsafe fn restore_irq(flags: IrqFlags) {
        if flags.flags() != 0 {
            Self::interrupt_enable();
        }
    }

    fn probe_total_irq_num() -> u32 {
        return NR_IRQS;
    }

    fn ack_bad_irq(_vector: HardwareIrqNumber) {
        use crate::arch::driver::apic::LocalAPIC;
        crate::arch::CurrentApic.send_eoi();
    }
}

/// mask一个电平触发的IOAPIC引脚。引脚号即中断线对应的GSI
pub fn ioapic_mask_pin(irq: IrqNumber) {
    crate::arch::driver::apic::ioapic::mask_gsi(irq.data());
}

pub fn ioapic_unmask_pin(irq: IrqNumber) {
    crate::arch::driver::apic::ioapic::unmask_gsi(irq.data());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_mapping_table_shape() {
        let mappings = irq_static_mappings();
        assert_eq!(mappings.len(), NR_STATIC_MAPPINGS);
        assert_eq!(mappings[0], (TIMER_IRQ, VECTOR_TIMER));
        assert_eq!(mappings[4], (CMCI_IRQ, VECTOR_CMCI));
        // posted-interrupt的行必须落在固定向量区间内
        for (_, vector) in mappings.iter().skip(NR_STATIC_MAPPINGS_1) {
            assert!(*vector >= VECTOR_FIXED_START && *vector <= VECTOR_FIXED_END);
        }
        // 静态行之间不允许重复
        for (i, a) in mappings.iter().enumerate() {
            for b in mappings.iter().skip(i + 1) {
                assert_ne!(a.0, b.0);
                assert_ne!(a.1, b.1);
            }
        }
    }
}
