use crate::arch::driver::tsc::TSCManager;
use crate::arch::CurrentTimeArch;

/// 时间相关的架构接口
pub trait TimeArch {
    /// 获取当前的时钟周期数（TSC）
    fn get_cycles() -> usize;
}

/// 8254 PIT的输入时钟频率（Hz）
pub const PIT_TICK_RATE: u64 = 1193182;

/// 读取当前TSC
#[inline(always)]
pub fn cpu_ticks() -> u64 {
    return CurrentTimeArch::get_cycles() as u64;
}

/// TSC频率（kHz）。校准完成之后不再变化
#[inline(always)]
pub fn cpu_tickrate() -> u64 {
    return TSCManager::tsc_khz();
}

/// 微秒转TSC周期数
#[inline]
pub fn us_to_ticks(us: u64) -> u64 {
    return us * cpu_tickrate() / 1000;
}

/// TSC周期数转微秒
#[inline]
pub fn ticks_to_us(ticks: u64) -> u64 {
    return ticks * 1000 / cpu_tickrate();
}

/// TSC周期数转毫秒
#[inline]
pub fn ticks_to_ms(ticks: u64) -> u64 {
    return ticks / cpu_tickrate();
}

/// 忙等待至少`us`微秒
pub fn udelay(us: u64) {
    let end = cpu_ticks() + us_to_ticks(us);
    while cpu_ticks() < end {
        core::hint::spin_loop();
    }
}
