//! 最小化的IOAPIC支持
//!
//! dispatch路径只需要对电平触发的引脚做mask/unmask，
//! 重定向表的完整编程（目的地、极性等）属于设备直通层，
//! 不在这里。

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::libs::spinlock::SpinLock;
use crate::mm::{MemoryManagementArch, MMArch, PhysAddr};

/// 重定向表项的mask位
const IOAPIC_RTE_MASKED: u64 = 1 << 16;
/// 重定向表从寄存器0x10开始，每个引脚两个32位寄存器
const IOAPIC_REG_RTE_BASE: u32 = 0x10;

static IOAPIC_BASE_HVA: AtomicUsize = AtomicUsize::new(0);
static IOAPIC_LOCK: SpinLock<()> = SpinLock::new(());

/// 记录IOAPIC的MMIO基址。未调用时所有mask/unmask都是空操作
pub fn ioapic_init(base: PhysAddr) {
    let hva = unsafe { MMArch::phys_2_virt(base) };
    if let Some(hva) = hva {
        IOAPIC_BASE_HVA.store(hva.data(), Ordering::Release);
    }
}

#[cfg(target_os = "none")]
unsafe fn ioapic_read(base: usize, reg: u32) -> u32 {
    core::ptr::write_volatile(base as *mut u32, reg);
    return core::ptr::read_volatile((base + 0x10) as *const u32);
}

#[cfg(target_os = "none")]
unsafe fn ioapic_write(base: usize, reg: u32, value: u32) {
    core::ptr::write_volatile(base as *mut u32, reg);
    core::ptr::write_volatile((base + 0x10) as *mut u32, value);
}

#[cfg(target_os = "none")]
fn set_gsi_masked(gsi: u32, masked: bool) {
    let base = IOAPIC_BASE_HVA.load(Ordering::Acquire);
    if base == 0 || gsi >= 120 {
        return;
    }
    let _guard = IOAPIC_LOCK.lock_irqsave();
    unsafe {
        let reg = IOAPIC_REG_RTE_BASE + gsi * 2;
        let mut lo = ioapic_read(base, reg) as u64;
        if masked {
            lo |= IOAPIC_RTE_MASKED;
        } else {
            lo &= !IOAPIC_RTE_MASKED;
        }
        ioapic_write(base, reg, lo as u32);
    }
}

#[cfg(not(target_os = "none"))]
fn set_gsi_masked(_gsi: u32, _masked: bool) {}

pub fn mask_gsi(gsi: u32) {
    set_gsi_masked(gsi, true);
}

pub fn unmask_gsi(gsi: u32) {
    set_gsi_masked(gsi, false);
}
