pub mod ioapic;
pub mod x2apic;

pub use x2apic::CurrentApic;

/// local APIC的统一操作接口
///
/// 本hypervisor要求平台支持x2APIC（见`detect_hardware_support`），
/// 因此只保留x2APIC一种实现。
pub trait LocalAPIC {
    /// 当前CPU的local APIC初始化
    fn init_current_cpu(&self) -> bool;

    /// 发送EOI
    fn send_eoi(&self);

    /// 写ICR，发起一次IPI
    fn write_icr(&self, icr: x86::apic::Icr);

    /// x2APIC是否已经使能
    fn x2apic_enabled(&self) -> bool;

    /// 当前CPU的APIC ID
    fn id(&self) -> u32;
}
