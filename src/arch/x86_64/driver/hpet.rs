//! HPET驱动
//!
//! 这里只用HPET做一件事：为TSC校准提供一个独立的参考计数器。
//! 比较器/中断一概不碰。基址来自平台配置（ACPI解析不在本层）。

use core::sync::atomic::{AtomicBool, Ordering};

use log::info;
use system_error::SystemError;

use crate::mm::{MemoryManagementArch, MMArch, PhysAddr, VirtAddr};

/// 通用能力寄存器（高32位是计数周期，单位飞秒）
const HPET_REG_CAP: usize = 0x00;
/// 通用配置寄存器
const HPET_REG_CFG: usize = 0x10;
/// 主计数器
const HPET_REG_MAIN_COUNTER: usize = 0xF0;

const HPET_CFG_ENABLE: u64 = 0x001;

static mut HPET_INSTANCE: Option<Hpet> = None;
static HPET_ENABLED: AtomicBool = AtomicBool::new(false);

#[inline(always)]
pub fn hpet_instance() -> &'static Hpet {
    unsafe { HPET_INSTANCE.as_ref().unwrap() }
}

#[inline(always)]
pub fn is_hpet_enabled() -> bool {
    return HPET_ENABLED.load(Ordering::Acquire);
}

#[derive(Debug)]
pub struct Hpet {
    base: VirtAddr,
    /// 主计数器的周期（飞秒）
    period_fs: u32,
}

impl Hpet {
    fn new(base: VirtAddr) -> Result<Self, SystemError> {
        let cap = unsafe { MMArch::read::<u64>(base.add(HPET_REG_CAP)) };
        let period_fs = (cap >> 32) as u32;
        // 周期为0或超过100ns都不是合法的HPET
        if period_fs == 0 || period_fs > 100_000_000 {
            return Err(SystemError::ENODEV);
        }
        return Ok(Self { base, period_fs });
    }

    pub fn period_fs(&self) -> u32 {
        self.period_fs
    }

    pub fn main_counter_value(&self) -> u64 {
        unsafe { MMArch::read::<u64>(self.base.add(HPET_REG_MAIN_COUNTER)) }
    }

    /// 打开主计数器
    fn enable(&self) {
        unsafe {
            let cfg = MMArch::read::<u64>(self.base.add(HPET_REG_CFG));
            MMArch::write::<u64>(self.base.add(HPET_REG_CFG), cfg | HPET_CFG_ENABLE);
        }
    }
}

/// 初始化HPET
///
/// `base`为None时平台没有HPET，属于正常情况（校准退回PIT）。
pub fn hpet_init(base: Option<PhysAddr>) -> Result<(), SystemError> {
    let base = match base {
        Some(b) => b,
        None => {
            info!("No HPET on this platform, TSC calibration falls back to PIT");
            return Ok(());
        }
    };

    let virt = unsafe { MMArch::phys_2_virt(base) }.ok_or(SystemError::EFAULT)?;
    let hpet = Hpet::new(virt)?;
    info!(
        "HPET at {:?}, period {} fs",
        base,
        hpet.period_fs()
    );
    hpet.enable();
    unsafe {
        HPET_INSTANCE = Some(hpet);
    }
    HPET_ENABLED.store(true, Ordering::Release);
    return Ok(());
}
