//! BSP的启动编排
//!
//! 顺序是硬约束：先有能力登记表才能做essential检查，sanitized
//! page要在任何页表建立之前就绪，静态IRQ映射要先于一切
//! request_irq，notify中断注册完SMP call才可用。

use log::info;
use system_error::SystemError;

use crate::arch::cpu::capability;
#[cfg(feature = "hpet")]
use crate::arch::driver::hpet;
use crate::arch::driver::tsc::TSCManager;
use crate::arch::vm::ept;
use crate::exception::{irqdesc, softirq};
use crate::mm::{page, PhysAddr};
use crate::smp;
use crate::smp::cpu::ProcessorId;
use crate::virt::vm;

/// hypervisor核心的BSP初始化
///
/// `sanitized_page`：启动代码预留的一个4KiB物理页，交给
/// L1TF absence模式使用，此后归本核心所有。
pub fn init_hypervisor_core(sanitized_page: PhysAddr) -> Result<(), SystemError> {
    crate::debug::klog::klog_init(log::LevelFilter::Info);

    // 能力登记表与硬性门槛
    capability::init_pcpu_capabilities();
    capability::detect_hardware_support()?;
    ept::init_ept_large_page_caps();

    // 页表引擎的absence模式
    unsafe { page::init_sanitized_page(sanitized_page)? };

    // 中断核心
    crate::arch::driver::apic::ioapic::ioapic_init(PhysAddr::new(
        crate::config::IOAPIC_BASE_HPA,
    ));
    irqdesc::early_irq_init()?;
    softirq::softirq_init()?;

    // SMP call与通知
    smp::cpu::smp_cpu_manager_init();
    smp::smp_init()?;
    vm::virt_init()?;
    smp::setup_notification()?;
    smp::setup_pi_notification()?;

    // 时间基准
    #[cfg(feature = "hpet")]
    hpet::hpet_init(crate::config::HPET_BASE_HPA.map(PhysAddr::new))?;
    TSCManager::calibrate_tsc()?;

    crate::exception::manage::irq_manager().init_interrupt(ProcessorId::new(0))?;
    smp::cpu::smp_cpu_manager().set_online(ProcessorId::new(0), true);
    info!("hypervisor core initialized");
    return Ok(());
}

/// AP上线路径：打开local APIC并标记在线
pub fn init_secondary_cpu(cpu: ProcessorId) -> Result<(), SystemError> {
    crate::exception::manage::irq_manager().init_interrupt(cpu)?;
    smp::cpu::smp_cpu_manager().set_online(cpu, true);
    return Ok(());
}
