use super::LocalAPIC;

/// IA32_APIC_BASE中的xAPIC/x2APIC使能位
#[cfg(target_os = "none")]
const APIC_BASE_XAPIC_ENABLE: u64 = 1 << 11;
#[cfg(target_os = "none")]
const APIC_BASE_X2APIC_ENABLE: u64 = 1 << 10;

/// x2APIC的MSR编号
#[cfg(target_os = "none")]
const MSR_X2APIC_APICID: u32 = 0x802;
#[cfg(target_os = "none")]
const MSR_X2APIC_EOI: u32 = 0x80B;
#[cfg(target_os = "none")]
const MSR_X2APIC_SPIV: u32 = 0x80F;
#[cfg(target_os = "none")]
const MSR_X2APIC_ICR: u32 = 0x830;

#[derive(Debug, Clone, Copy)]
pub struct CurrentApic;

impl LocalAPIC for CurrentApic {
    /// 打开x2APIC模式并设置spurious vector
    fn init_current_cpu(&self) -> bool {
        #[cfg(target_os = "none")]
        unsafe {
            use x86::msr;
            let base = msr::rdmsr(msr::IA32_APIC_BASE);
            msr::wrmsr(
                msr::IA32_APIC_BASE,
                base | APIC_BASE_XAPIC_ENABLE | APIC_BASE_X2APIC_ENABLE,
            );
            // software enable + spurious vector 0xFF
            msr::wrmsr(MSR_X2APIC_SPIV, 0x1FF);
        }
        return true;
    }

    #[inline(always)]
    fn send_eoi(&self) {
        #[cfg(target_os = "none")]
        unsafe {
            x86::msr::wrmsr(MSR_X2APIC_EOI, 0);
        }
    }

    fn write_icr(&self, icr: x86::apic::Icr) {
        #[cfg(target_os = "none")]
        unsafe {
            let val = ((icr.upper() as u64) << 32) | icr.lower() as u64;
            x86::msr::wrmsr(MSR_X2APIC_ICR, val);
        }
        #[cfg(not(target_os = "none"))]
        {
            let _ = icr;
        }
    }

    fn x2apic_enabled(&self) -> bool {
        #[cfg(target_os = "none")]
        unsafe {
            use x86::msr;
            return msr::rdmsr(msr::IA32_APIC_BASE) & APIC_BASE_X2APIC_ENABLE != 0;
        }
        #[cfg(not(target_os = "none"))]
        {
            return true;
        }
    }

    fn id(&self) -> u32 {
        #[cfg(target_os = "none")]
        unsafe {
            return x86::msr::rdmsr(MSR_X2APIC_APICID) as u32;
        }
        #[cfg(not(target_os = "none"))]
        {
            return 0;
        }
    }
}
