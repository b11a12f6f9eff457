//! 虚拟化MSR的拦截策略
//!
//! vCPU初始化时据此填充MSR位图：被模拟的MSR读写都拦截，
//! 刻意隐藏的MSR也拦截（模拟层对它们回答拒绝访问），性能
//! 计数器按PMU直通与否决定，x2APIC区间按LAPIC直通与APICv
//! 档位决定。

use alloc::vec::Vec;

use super::msr_bitmap::{enable_msr_interception, MsrInterceptMode, VmxMsrBitmap};

// ---- 被模拟的MSR ----
pub const MSR_IA32_TSC: u32 = 0x10;
pub const MSR_IA32_APIC_BASE: u32 = 0x1B;
pub const MSR_IA32_FEATURE_CONTROL: u32 = 0x3A;
pub const MSR_IA32_TSC_ADJUST: u32 = 0x3B;
pub const MSR_IA32_SGXLEPUBKEYHASH0: u32 = 0x8C;
pub const MSR_IA32_SGXLEPUBKEYHASH1: u32 = 0x8D;
pub const MSR_IA32_SGXLEPUBKEYHASH2: u32 = 0x8E;
pub const MSR_IA32_SGXLEPUBKEYHASH3: u32 = 0x8F;
pub const MSR_IA32_UMWAIT_CONTROL: u32 = 0xE1;
pub const MSR_IA32_MISC_ENABLE: u32 = 0x1A0;
pub const MSR_IA32_PERF_STATUS: u32 = 0x198;
pub const MSR_IA32_PERF_CTL: u32 = 0x199;
pub const MSR_IA32_THERM_INTERRUPT: u32 = 0x19B;
pub const MSR_IA32_THERM_STATUS: u32 = 0x19C;
pub const MSR_IA32_PAT: u32 = 0x277;
pub const MSR_IA32_TSC_DEADLINE: u32 = 0x6E0;
pub const MSR_IA32_PM_ENABLE: u32 = 0x770;
pub const MSR_IA32_HWP_CAPABILITIES: u32 = 0x771;
pub const MSR_IA32_HWP_REQUEST: u32 = 0x774;
pub const MSR_IA32_HWP_STATUS: u32 = 0x777;
pub const MSR_IA32_XSS: u32 = 0xDA0;
pub const MSR_IA32_EFER: u32 = 0xC000_0080;

/// 这些MSR由模拟层承接，读写都必须VM-exit
pub const EMULATED_GUEST_MSRS: &[u32] = &[
    MSR_IA32_TSC,
    MSR_IA32_APIC_BASE,
    MSR_IA32_FEATURE_CONTROL,
    MSR_IA32_TSC_ADJUST,
    MSR_IA32_SGXLEPUBKEYHASH0,
    MSR_IA32_SGXLEPUBKEYHASH1,
    MSR_IA32_SGXLEPUBKEYHASH2,
    MSR_IA32_SGXLEPUBKEYHASH3,
    MSR_IA32_UMWAIT_CONTROL,
    MSR_IA32_MISC_ENABLE,
    MSR_IA32_PERF_STATUS,
    MSR_IA32_PERF_CTL,
    MSR_IA32_THERM_INTERRUPT,
    MSR_IA32_THERM_STATUS,
    MSR_IA32_PAT,
    MSR_IA32_TSC_DEADLINE,
    MSR_IA32_PM_ENABLE,
    MSR_IA32_HWP_CAPABILITIES,
    MSR_IA32_HWP_REQUEST,
    MSR_IA32_HWP_STATUS,
    MSR_IA32_XSS,
    MSR_IA32_EFER,
];

// ---- MTRR ----
pub const MSR_IA32_MTRR_CAP: u32 = 0xFE;
pub const MSR_IA32_MTRR_DEF_TYPE: u32 = 0x2FF;
pub const MSR_IA32_MTRR_FIX64K_00000: u32 = 0x250;
pub const MSR_IA32_MTRR_FIX16K_80000: u32 = 0x258;
pub const MSR_IA32_MTRR_FIX16K_A0000: u32 = 0x259;
pub const MSR_IA32_MTRR_FIX4K_C0000: u32 = 0x268;
pub const MSR_IA32_MTRR_FIX4K_F8000: u32 = 0x26F;
/// 可变MTRR的起点（PHYSBASE0），模拟层对它们回答拒绝访问
pub const MSR_IA32_MTRR_PHYSBASE0: u32 = 0x200;

/// 固定MTRR与控制寄存器：读写拦截，由模拟层承接
pub fn mtrr_msrs() -> Vec<u32> {
    let mut msrs = vec![MSR_IA32_MTRR_CAP, MSR_IA32_MTRR_DEF_TYPE];
    msrs.push(MSR_IA32_MTRR_FIX64K_00000);
    msrs.push(MSR_IA32_MTRR_FIX16K_80000);
    msrs.push(MSR_IA32_MTRR_FIX16K_A0000);
    for msr in MSR_IA32_MTRR_FIX4K_C0000..=MSR_IA32_MTRR_FIX4K_F8000 {
        msrs.push(msr);
    }
    return msrs;
}

// ---- 性能计数器 ----
pub const MSR_IA32_PMC0: u32 = 0xC1;
pub const MSR_IA32_PMC7: u32 = 0xC8;
pub const MSR_IA32_PERFEVTSEL0: u32 = 0x186;
pub const MSR_IA32_PERFEVTSEL3: u32 = 0x189;
pub const MSR_IA32_PERF_CAPABILITIES: u32 = 0x345;
pub const MSR_IA32_FIXED_CTR0: u32 = 0x309;
pub const MSR_IA32_FIXED_CTR2: u32 = 0x30B;
pub const MSR_IA32_FIXED_CTR_CTL: u32 = 0x38D;
pub const MSR_IA32_PERF_GLOBAL_STATUS: u32 = 0x38E;
pub const MSR_IA32_PERF_GLOBAL_CTRL: u32 = 0x38F;
pub const MSR_IA32_PERF_GLOBAL_OVF_CTRL: u32 = 0x390;
pub const MSR_IA32_PEBS_ENABLE: u32 = 0x3F1;
pub const MSR_IA32_DS_AREA: u32 = 0x600;

/// PMU相关MSR：除非PMU直通，否则读写拦截
pub fn pmc_msrs() -> Vec<u32> {
    let mut msrs = Vec::new();
    for msr in MSR_IA32_PMC0..=MSR_IA32_PMC7 {
        msrs.push(msr);
    }
    for msr in MSR_IA32_PERFEVTSEL0..=MSR_IA32_PERFEVTSEL3 {
        msrs.push(msr);
    }
    for msr in MSR_IA32_FIXED_CTR0..=MSR_IA32_FIXED_CTR2 {
        msrs.push(msr);
    }
    msrs.extend_from_slice(&[
        MSR_IA32_PERF_CAPABILITIES,
        MSR_IA32_FIXED_CTR_CTL,
        MSR_IA32_PERF_GLOBAL_STATUS,
        MSR_IA32_PERF_GLOBAL_CTRL,
        MSR_IA32_PERF_GLOBAL_OVF_CTRL,
        MSR_IA32_PEBS_ENABLE,
        MSR_IA32_DS_AREA,
    ]);
    return msrs;
}

// ---- 刻意隐藏的MSR ----
pub const MSR_IA32_SMM_MONITOR_CTL: u32 = 0x9B;
pub const MSR_IA32_PRMRR_PHYS_BASE: u32 = 0x1F4;
pub const MSR_IA32_PRMRR_PHYS_MASK: u32 = 0x1F5;
pub const MSR_SGXOWNEREPOCH0: u32 = 0x300;
pub const MSR_SGXOWNEREPOCH1: u32 = 0x301;
pub const MSR_IA32_RTIT_OUTPUT_BASE: u32 = 0x560;
pub const MSR_IA32_RTIT_OUTPUT_MASK_PTRS: u32 = 0x561;
pub const MSR_IA32_RTIT_CTL: u32 = 0x570;
pub const MSR_IA32_RTIT_STATUS: u32 = 0x571;
pub const MSR_IA32_RTIT_CR3_MATCH: u32 = 0x572;
pub const MSR_IA32_RTIT_ADDR0_A: u32 = 0x580;
pub const MSR_IA32_RTIT_ADDR3_B: u32 = 0x587;
pub const MSR_IA32_U_CET: u32 = 0x6A0;
pub const MSR_IA32_S_CET: u32 = 0x6A2;
pub const MSR_IA32_PL0_SSP: u32 = 0x6A4;
pub const MSR_IA32_INTERRUPT_SSP_TABLE_ADDR: u32 = 0x6A8;
pub const MSR_IA32_HWP_REQUEST_PKG: u32 = 0x772;
pub const MSR_IA32_HWP_INTERRUPT: u32 = 0x773;
pub const MSR_IA32_QM_EVTSEL: u32 = 0xC8D;
pub const MSR_IA32_QM_CTR: u32 = 0xC8E;
pub const MSR_IA32_PQR_ASSOC: u32 = 0xC8F;
pub const MSR_IA32_DEBUG_INTERFACE: u32 = 0xC80;
pub const MSR_IA32_BNDCFGS: u32 = 0xD90;
pub const MSR_IA32_HW_FEEDBACK_PTR: u32 = 0x17D0;
pub const MSR_IA32_HW_FEEDBACK_CONFIG: u32 = 0x17D1;

/// RDT-A的CLOS掩码区起点（L3 CAT）
pub const MSR_IA32_L3_MASK_BASE: u32 = 0xC90;

/// 不向guest提供的MSR：读写拦截，模拟层回答拒绝访问
pub fn unsupported_msrs() -> Vec<u32> {
    let mut msrs = vec![
        MSR_IA32_SMM_MONITOR_CTL,
        MSR_IA32_PRMRR_PHYS_BASE,
        MSR_IA32_PRMRR_PHYS_MASK,
        MSR_SGXOWNEREPOCH0,
        MSR_SGXOWNEREPOCH1,
        MSR_IA32_RTIT_OUTPUT_BASE,
        MSR_IA32_RTIT_OUTPUT_MASK_PTRS,
        MSR_IA32_RTIT_CTL,
        MSR_IA32_RTIT_STATUS,
        MSR_IA32_RTIT_CR3_MATCH,
        MSR_IA32_DEBUG_INTERFACE,
        MSR_IA32_BNDCFGS,
        MSR_IA32_HWP_REQUEST_PKG,
        MSR_IA32_HWP_INTERRUPT,
        MSR_IA32_QM_EVTSEL,
        MSR_IA32_QM_CTR,
        MSR_IA32_PQR_ASSOC,
        MSR_IA32_HW_FEEDBACK_PTR,
        MSR_IA32_HW_FEEDBACK_CONFIG,
    ];
    for msr in MSR_IA32_RTIT_ADDR0_A..=MSR_IA32_RTIT_ADDR3_B {
        msrs.push(msr);
    }
    for msr in MSR_IA32_U_CET..=MSR_IA32_INTERRUPT_SSP_TABLE_ADDR {
        msrs.push(msr);
    }
    // 可变MTRR也按不支持处理
    for msr in MSR_IA32_MTRR_PHYSBASE0..MSR_IA32_MTRR_PHYSBASE0 + 0x10 {
        msrs.push(msr);
    }
    return msrs;
}

// ---- x2APIC ----
pub const MSR_X2APIC_START: u32 = 0x800;
pub const MSR_X2APIC_END: u32 = 0x900;
pub const MSR_X2APIC_XAPICID: u32 = 0x802;
pub const MSR_X2APIC_TPR: u32 = 0x808;
pub const MSR_X2APIC_EOI: u32 = 0x80B;
pub const MSR_X2APIC_LDR: u32 = 0x80D;
pub const MSR_X2APIC_ICR: u32 = 0x830;
pub const MSR_X2APIC_LVT_THERMAL: u32 = 0x833;
pub const MSR_X2APIC_SELF_IPI: u32 = 0x83F;

fn intercept_x2apic_msrs(bitmap: &mut VmxMsrBitmap, mode: MsrInterceptMode) {
    for msr in MSR_X2APIC_START..MSR_X2APIC_END {
        enable_msr_interception(bitmap, msr, mode).unwrap();
    }
}

/// x2APIC区间的策略
///
/// - LAPIC直通：guest直接操作硬件APIC，整段放行；只有ID类
///   寄存器和hypervisor保留的温度LVT需要经过模拟。
/// - APICv高级（有virtual interrupt delivery）：读走APIC page
///   虚拟化不必退出，写默认拦截；TPR/EOI/SELF_IPI由硬件虚拟化
///   直通，ICR必须拦截。
/// - 其余（APICv基础）：整段读写拦截，vlapic全软件模拟。
fn setup_x2apic_policy(bitmap: &mut VmxMsrBitmap, lapic_pt: bool, apicv_advanced: bool) {
    if lapic_pt {
        intercept_x2apic_msrs(bitmap, MsrInterceptMode::Disable);
        enable_msr_interception(bitmap, MSR_X2APIC_XAPICID, MsrInterceptMode::Read).unwrap();
        enable_msr_interception(bitmap, MSR_X2APIC_LDR, MsrInterceptMode::Read).unwrap();
        enable_msr_interception(bitmap, MSR_X2APIC_LVT_THERMAL, MsrInterceptMode::ReadWrite)
            .unwrap();
    } else if apicv_advanced {
        intercept_x2apic_msrs(bitmap, MsrInterceptMode::Write);
        enable_msr_interception(bitmap, MSR_X2APIC_XAPICID, MsrInterceptMode::Read).unwrap();
        enable_msr_interception(bitmap, MSR_X2APIC_LDR, MsrInterceptMode::Read).unwrap();
        enable_msr_interception(bitmap, MSR_X2APIC_ICR, MsrInterceptMode::ReadWrite).unwrap();
        enable_msr_interception(bitmap, MSR_X2APIC_TPR, MsrInterceptMode::Disable).unwrap();
        enable_msr_interception(bitmap, MSR_X2APIC_EOI, MsrInterceptMode::Disable).unwrap();
        enable_msr_interception(bitmap, MSR_X2APIC_SELF_IPI, MsrInterceptMode::Disable).unwrap();
        enable_msr_interception(bitmap, MSR_X2APIC_LVT_THERMAL, MsrInterceptMode::ReadWrite)
            .unwrap();
    } else {
        intercept_x2apic_msrs(bitmap, MsrInterceptMode::ReadWrite);
    }
}

/// 为一个vCPU构建MSR拦截位图
///
/// `lapic_pt`/`pmu_pt`来自VM配置，`apicv_advanced`来自平台能力。
pub fn init_msr_bitmap(lapic_pt: bool, pmu_pt: bool, apicv_advanced: bool) -> VmxMsrBitmap {
    let mut bitmap = VmxMsrBitmap::new(false);

    for msr in EMULATED_GUEST_MSRS {
        enable_msr_interception(&mut bitmap, *msr, MsrInterceptMode::ReadWrite).unwrap();
    }
    for msr in mtrr_msrs() {
        enable_msr_interception(&mut bitmap, msr, MsrInterceptMode::ReadWrite).unwrap();
    }
    if !pmu_pt {
        for msr in pmc_msrs() {
            enable_msr_interception(&mut bitmap, msr, MsrInterceptMode::ReadWrite).unwrap();
        }
    }
    for msr in unsupported_msrs() {
        enable_msr_interception(&mut bitmap, msr, MsrInterceptMode::ReadWrite).unwrap();
    }
    // RDT-A分配区整段拦截
    for msr in MSR_IA32_L3_MASK_BASE..MSR_IA32_BNDCFGS {
        enable_msr_interception(&mut bitmap, msr, MsrInterceptMode::ReadWrite).unwrap();
    }

    setup_x2apic_policy(&mut bitmap, lapic_pt, apicv_advanced);

    return bitmap;
}

/// VMCS自动保存/恢复区的一项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsrStoreEntry {
    pub msr: u32,
    pub value: u64,
}

/// 构建VM-entry/exit自动切换的MSR列表
///
/// 这个区域很小：只有PMU直通时的PERF_GLOBAL_CTRL，以及宿主
/// 机与guest的CLOS不同时的PQR_ASSOC。
pub fn build_msr_store_list(pmu_pt: bool) -> Vec<MsrStoreEntry> {
    let mut entries = Vec::new();
    if pmu_pt {
        entries.push(MsrStoreEntry {
            msr: MSR_IA32_PERF_GLOBAL_CTRL,
            value: 0,
        });
    }
    if crate::config::HV_CLOS != crate::config::GUEST_CLOS {
        entries.push(MsrStoreEntry {
            msr: MSR_IA32_PQR_ASSOC,
            value: (crate::config::GUEST_CLOS as u64) << 32,
        });
    }
    return entries;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::vm::vmx::msr_bitmap::VmxMsrBitmapAccess;

    #[test]
    fn test_emulated_msrs_fully_intercepted() {
        let bitmap = init_msr_bitmap(false, false, false);
        for msr in [MSR_IA32_PAT, MSR_IA32_EFER, MSR_IA32_APIC_BASE, MSR_IA32_XSS] {
            assert!(bitmap.is_intercepted(msr, VmxMsrBitmapAccess::Read), "{:#x}", msr);
            assert!(bitmap.is_intercepted(msr, VmxMsrBitmapAccess::Write), "{:#x}", msr);
        }
        // 可变MTRR在不支持列表里
        assert!(bitmap.is_intercepted(MSR_IA32_MTRR_PHYSBASE0, VmxMsrBitmapAccess::Write));
    }

    #[test]
    fn test_pmu_passthrough_leaves_pmcs_open() {
        let intercepted = init_msr_bitmap(false, false, false);
        assert!(intercepted.is_intercepted(MSR_IA32_PMC0, VmxMsrBitmapAccess::Read));

        let pt = init_msr_bitmap(false, true, false);
        assert!(!pt.is_intercepted(MSR_IA32_PMC0, VmxMsrBitmapAccess::Read));
        assert!(!pt.is_intercepted(MSR_IA32_PERF_GLOBAL_CTRL, VmxMsrBitmapAccess::Write));
    }

    #[test]
    fn test_x2apic_policy_modes() {
        // 全模拟：整段读写拦截
        let emulated = init_msr_bitmap(false, false, false);
        assert!(emulated.is_intercepted(0x820, VmxMsrBitmapAccess::Read));
        assert!(emulated.is_intercepted(0x820, VmxMsrBitmapAccess::Write));

        // APICv高级：读放行，写拦截；TPR/EOI/SELF_IPI放行，ICR拦截
        let advanced = init_msr_bitmap(false, false, true);
        assert!(!advanced.is_intercepted(0x820, VmxMsrBitmapAccess::Read));
        assert!(advanced.is_intercepted(0x820, VmxMsrBitmapAccess::Write));
        assert!(!advanced.is_intercepted(MSR_X2APIC_TPR, VmxMsrBitmapAccess::Write));
        assert!(!advanced.is_intercepted(MSR_X2APIC_EOI, VmxMsrBitmapAccess::Write));
        assert!(!advanced.is_intercepted(MSR_X2APIC_SELF_IPI, VmxMsrBitmapAccess::Write));
        assert!(advanced.is_intercepted(MSR_X2APIC_ICR, VmxMsrBitmapAccess::Write));
        assert!(advanced.is_intercepted(MSR_X2APIC_XAPICID, VmxMsrBitmapAccess::Read));

        // LAPIC直通：除了ID类和温度LVT，整段放行
        let lapic_pt = init_msr_bitmap(true, false, false);
        assert!(!lapic_pt.is_intercepted(MSR_X2APIC_ICR, VmxMsrBitmapAccess::Write));
        assert!(!lapic_pt.is_intercepted(0x820, VmxMsrBitmapAccess::Read));
        assert!(lapic_pt.is_intercepted(MSR_X2APIC_XAPICID, VmxMsrBitmapAccess::Read));
        assert!(lapic_pt.is_intercepted(MSR_X2APIC_LVT_THERMAL, VmxMsrBitmapAccess::Write));
    }

    #[test]
    fn test_msr_store_list() {
        // 默认配置下CLOS一致，PMU不直通：自动保存区为空
        assert!(build_msr_store_list(false).is_empty());
        let with_pmu = build_msr_store_list(true);
        assert_eq!(with_pmu.len(), 1);
        assert_eq!(with_pmu[0].msr, MSR_IA32_PERF_GLOBAL_CTRL);
    }
}
