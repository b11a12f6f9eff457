use core::sync::atomic::{AtomicU64, Ordering};

use log::{error, info, warn};
use system_error::SystemError;

#[derive(Debug)]
pub struct TSCManager;

static TSC_KHZ: AtomicU64 = AtomicU64::new(0);

impl TSCManager {
    /// 校准TSC频率
    ///
    /// 优先使用CPUID.15H给出的晶振频率；没有时退回HPET/PIT实测，
    /// 并用CPUID.16H的标称频率做交叉校验（偏差超过5%时采用标称值）。
    /// 只应在BSP上调用一次。
    pub fn calibrate_tsc() -> Result<(), SystemError> {
        if Self::tsc_khz() != 0 {
            warn!("TSC frequency already determined");
            return Ok(());
        }

        if let Some(khz) = Self::tsc_khz_from_cpuid_0x15() {
            Self::set_tsc_khz(khz);
            info!("Detected {}.{} MHz TSC by CPUID.15H", khz / 1000, khz % 1000);
            return Ok(());
        }

        let reference = Self::tsc_khz_from_cpuid_0x16().unwrap_or(0);
        let measured = Self::calibrate_by_hpet_or_pit(crate::config::TSC_CALIBRATE_MS)?;
        let khz = Self::reconcile_with_reference(measured, reference);
        if khz == 0 {
            error!("Failed to determine TSC frequency");
            return Err(SystemError::ENODEV);
        }

        Self::set_tsc_khz(khz);
        info!("Detected {}.{} MHz TSC", khz / 1000, khz % 1000);
        return Ok(());
    }

    pub fn tsc_khz() -> u64 {
        TSC_KHZ.load(Ordering::Acquire)
    }

    fn set_tsc_khz(khz: u64) {
        TSC_KHZ.store(khz, Ordering::Release);
    }

    #[cfg(test)]
    pub fn set_tsc_khz_for_test(khz: u64) {
        Self::set_tsc_khz(khz);
    }

    /// CPUID.15H：crystal_hz * numerator / denominator
    fn tsc_khz_from_cpuid_0x15() -> Option<u64> {
        let leaf = unsafe { ::core::arch::x86_64::__cpuid_count(0, 0) };
        if leaf.eax < 0x15 {
            return None;
        }
        let leaf = unsafe { ::core::arch::x86_64::__cpuid_count(0x15, 0) };
        return Self::calc_cpuid_0x15_khz(leaf.eax, leaf.ebx, leaf.ecx);
    }

    pub(crate) fn calc_cpuid_0x15_khz(den: u32, num: u32, crystal_hz: u32) -> Option<u64> {
        if den == 0 || num == 0 || crystal_hz == 0 {
            return None;
        }
        return Some(crystal_hz as u64 * num as u64 / den as u64 / 1000);
    }

    /// CPUID.16H：处理器基础频率（MHz），换算成kHz
    fn tsc_khz_from_cpuid_0x16() -> Option<u64> {
        let leaf = unsafe { ::core::arch::x86_64::__cpuid_count(0, 0) };
        if leaf.eax < 0x16 {
            return None;
        }
        let leaf = unsafe { ::core::arch::x86_64::__cpuid_count(0x16, 0) };
        if leaf.eax == 0 {
            return None;
        }
        return Some(leaf.eax as u64 * 1000);
    }

    /// 实测值与标称值的取舍：偏差超过5%时认为实测被干扰，取标称值
    pub(crate) fn reconcile_with_reference(measured: u64, reference: u64) -> u64 {
        if measured == 0 {
            return reference;
        }
        if reference == 0 {
            return measured;
        }
        let delta = measured.abs_diff(reference);
        if delta * 20 > reference {
            warn!(
                "TSC calibration deviates from CPUID.16H: measured={} reference={}",
                measured, reference
            );
            return reference;
        }
        return measured;
    }

    /// 根据HPET参考值计算TSC频率（kHz）
    ///
    /// `khz = Δtsc * 10^12 / (Δhpet * period_fs)`，HPET主计数器是
    /// 32位的，`ref2 <= ref1`说明期间发生了回绕。
    pub(crate) fn calc_hpet_khz(delta_tsc: u64, ref1: u64, mut ref2: u64, period_fs: u64) -> u64 {
        if ref2 <= ref1 {
            ref2 += 0x1_0000_0000;
        }
        let delta_hpet = ref2 - ref1;
        if delta_hpet == 0 || period_fs == 0 {
            return 0;
        }
        let khz = (delta_tsc as u128) * 1_000_000_000_000u128
            / (delta_hpet as u128 * period_fs as u128);
        return khz as u64;
    }

    /// 用HPET（存在时）或PIT实测TSC频率
    #[cfg(target_os = "none")]
    fn calibrate_by_hpet_or_pit(cal_ms: u64) -> Result<u64, SystemError> {
        use super::hpet::is_hpet_enabled;
        use crate::arch::CurrentIrqArch;
        use crate::exception::InterruptArch;
        use crate::time::cpu_ticks;
        use log::debug;

        debug!(
            "Calibrating TSC with {}",
            if is_hpet_enabled() { "HPET" } else { "PIT" }
        );

        let irq_guard = unsafe { CurrentIrqArch::save_and_disable_irq() };

        if is_hpet_enabled() {
            let hpet = super::hpet::hpet_instance();
            let tsc1 = cpu_ticks();
            let ref1 = hpet.main_counter_value() & 0xFFFF_FFFF;
            Self::pit_delay(cal_ms);
            let tsc2 = cpu_ticks();
            let ref2 = hpet.main_counter_value() & 0xFFFF_FFFF;
            drop(irq_guard);

            if ref1 == ref2 {
                warn!("HPET did not tick during calibration");
                return Err(SystemError::ENODEV);
            }
            return Ok(Self::calc_hpet_khz(tsc2 - tsc1, ref1, ref2, hpet.period_fs() as u64));
        }

        let khz = Self::pit_calibrate_tsc(cal_ms);
        drop(irq_guard);
        return khz.ok_or(SystemError::ENODEV);
    }

    /// 宿主机环境没有可编程的PIT/HPET，实测路径不可用
    #[cfg(not(target_os = "none"))]
    fn calibrate_by_hpet_or_pit(_cal_ms: u64) -> Result<u64, SystemError> {
        return Err(SystemError::ENODEV);
    }

    /// 让PIT通道0从目标计数值倒数到0，期间轮询等待
    #[cfg(target_os = "none")]
    fn pit_delay(ms: u64) {
        Self::pit_calibrate_tsc(ms);
    }

    /// 用PIT通道0做一次倒计时，返回实测的TSC频率（kHz）
    ///
    /// 通道0被编程为mode 0（终止计数中断模式），写入latch后
    /// 轮询当前计数值，计数越过目标即认为经过了`ms`毫秒。
    #[cfg(target_os = "none")]
    fn pit_calibrate_tsc(ms: u64) -> Option<u64> {
        use crate::time::{cpu_ticks, PIT_TICK_RATE};
        use x86::io::{inb, outb};

        let latch = (PIT_TICK_RATE * ms / 1000) as u16;

        unsafe {
            // 通道0，先低后高字节，mode 0，二进制计数
            outb(0x43, 0x30);
            outb(0x40, (latch & 0xFF) as u8);
            outb(0x40, (latch >> 8) as u8);
        }

        let t1 = cpu_ticks();
        let mut polls = 0u64;
        loop {
            let count = unsafe {
                // 锁存通道0的当前计数
                outb(0x43, 0x00);
                let lo = inb(0x40) as u16;
                let hi = inb(0x40) as u16;
                (hi << 8) | lo
            };
            polls += 1;
            // mode 0计数到0后会回绕，越过latch说明计满
            if count == 0 || count > latch {
                break;
            }
            core::hint::spin_loop();
        }
        let t2 = cpu_ticks();

        // 轮询次数过少说明期间被SMI之类的事件打断，丢弃本次结果
        if polls < 100 {
            warn!("PIT calibration interrupted (polls={})", polls);
            return None;
        }

        return Some((t2 - t1) / ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpuid_0x15_math() {
        // 24MHz晶振，数值取自真实的CFL平台：192/2 * 24MHz = 2304MHz
        assert_eq!(
            TSCManager::calc_cpuid_0x15_khz(2, 192, 24_000_000),
            Some(2_304_000)
        );
        assert_eq!(TSCManager::calc_cpuid_0x15_khz(0, 192, 24_000_000), None);
        assert_eq!(TSCManager::calc_cpuid_0x15_khz(2, 0, 24_000_000), None);
        assert_eq!(TSCManager::calc_cpuid_0x15_khz(2, 192, 0), None);
    }

    #[test]
    fn test_reference_reconciliation() {
        // 5%以内：相信实测值
        assert_eq!(TSCManager::reconcile_with_reference(2_310_000, 2_300_000), 2_310_000);
        // 超过5%：采用标称值
        assert_eq!(TSCManager::reconcile_with_reference(2_000_000, 2_300_000), 2_300_000);
        assert_eq!(TSCManager::reconcile_with_reference(0, 2_300_000), 2_300_000);
        assert_eq!(TSCManager::reconcile_with_reference(2_304_000, 0), 2_304_000);
    }

    #[test]
    fn test_hpet_khz_math() {
        // 10ms @ 2.4GHz，HPET周期69.841279ns（14.318MHz）
        let period_fs = 69_841_279u64;
        let delta_hpet = 10_000_000_000_000u64 / period_fs; // 10ms的HPET计数
        let khz = TSCManager::calc_hpet_khz(24_000_000, 100, 100 + delta_hpet, period_fs);
        assert!((2_390_000..=2_410_000).contains(&khz), "khz={}", khz);
    }

    #[test]
    fn test_hpet_wraparound() {
        let period_fs = 69_841_279u64;
        let delta_hpet = 10_000_000_000_000u64 / period_fs;
        // ref2在回绕之后小于ref1
        let ref1 = 0xFFFF_FFFFu64 - delta_hpet / 2;
        let ref2 = (ref1 + delta_hpet) & 0xFFFF_FFFF;
        assert!(ref2 < ref1);
        let khz = TSCManager::calc_hpet_khz(24_000_000, ref1, ref2, period_fs);
        assert!((2_390_000..=2_410_000).contains(&khz), "khz={}", khz);
    }
}
