//! CPU能力登记表
//!
//! 启动时在BSP上读取一次CPUID和VMX能力MSR，此后全程只读。
//! 所有"平台是否支持X"的查询都从这里走，不再各自执行CPUID。

use log::error;
use system_error::SystemError;

/// CPUID特性寄存器的存储槽位
pub const FEAT_1_ECX: u32 = 0;
pub const FEAT_1_EDX: u32 = 1;
pub const FEAT_7_0_EBX: u32 = 2;
pub const FEAT_7_0_ECX: u32 = 3;
pub const FEAT_7_0_EDX: u32 = 4;
pub const FEAT_8000_0001_ECX: u32 = 5;
pub const FEAT_8000_0001_EDX: u32 = 6;
pub const FEAT_8000_0007_EDX: u32 = 7;
pub const FEAT_8000_0008_EBX: u32 = 8;
pub const FEAT_D_1_EAX: u32 = 9;
pub const FEATURE_WORDS: usize = 10;

/// 把(槽位, 位号)打包成一个特性编号
#[inline(always)]
pub const fn feature_bit(word: u32, bit: u32) -> u32 {
    (word << 5) | bit
}

pub const X86_FEATURE_MONITOR: u32 = feature_bit(FEAT_1_ECX, 3);
pub const X86_FEATURE_VMX: u32 = feature_bit(FEAT_1_ECX, 5);
pub const X86_FEATURE_X2APIC: u32 = feature_bit(FEAT_1_ECX, 21);
pub const X86_FEATURE_TSC_DEADLINE: u32 = feature_bit(FEAT_1_ECX, 24);
pub const X86_FEATURE_POPCNT: u32 = feature_bit(FEAT_1_ECX, 23);
pub const X86_FEATURE_XSAVE: u32 = feature_bit(FEAT_1_ECX, 26);
pub const X86_FEATURE_RDRAND: u32 = feature_bit(FEAT_1_ECX, 30);

pub const X86_FEATURE_TSC: u32 = feature_bit(FEAT_1_EDX, 4);
pub const X86_FEATURE_MCE: u32 = feature_bit(FEAT_1_EDX, 7);
pub const X86_FEATURE_MTRR: u32 = feature_bit(FEAT_1_EDX, 12);
pub const X86_FEATURE_MCA: u32 = feature_bit(FEAT_1_EDX, 14);
pub const X86_FEATURE_PAT: u32 = feature_bit(FEAT_1_EDX, 16);
pub const X86_FEATURE_CLFSH: u32 = feature_bit(FEAT_1_EDX, 19);
pub const X86_FEATURE_SSE: u32 = feature_bit(FEAT_1_EDX, 25);

pub const X86_FEATURE_FAST_STRING: u32 = feature_bit(FEAT_7_0_EBX, 0);
pub const X86_FEATURE_SMEP: u32 = feature_bit(FEAT_7_0_EBX, 7);
pub const X86_FEATURE_ERMS: u32 = feature_bit(FEAT_7_0_EBX, 9);
pub const X86_FEATURE_RDT_A: u32 = feature_bit(FEAT_7_0_EBX, 15);
pub const X86_FEATURE_SMAP: u32 = feature_bit(FEAT_7_0_EBX, 20);
pub const X86_FEATURE_CLFLUSHOPT: u32 = feature_bit(FEAT_7_0_EBX, 23);

pub const X86_FEATURE_WAITPKG: u32 = feature_bit(FEAT_7_0_ECX, 5);

pub const X86_FEATURE_CORE_CAPABILITY: u32 = feature_bit(FEAT_7_0_EDX, 30);

pub const X86_FEATURE_NX: u32 = feature_bit(FEAT_8000_0001_EDX, 20);
pub const X86_FEATURE_PAGE1GB: u32 = feature_bit(FEAT_8000_0001_EDX, 26);
pub const X86_FEATURE_LM: u32 = feature_bit(FEAT_8000_0001_EDX, 29);

pub const X86_FEATURE_INVA_TSC: u32 = feature_bit(FEAT_8000_0007_EDX, 8);

pub const X86_FEATURE_XSAVES: u32 = feature_bit(FEAT_D_1_EAX, 3);

/// x86_64架构定义的物理地址位数上限
const MAXIMUM_PA_WIDTH: u8 = 52;

/// IA32_VMX_BASIC[48]：置位表示VMX结构的物理地址被限制在32位内
const VMX_BASIC_ADDR_WIDTH_32: u64 = 1 << 48;

/// IA32_FEATURE_CONTROL的锁定位与SMX外VMXON使能位
const FEATURE_CONTROL_LOCK: u64 = 1 << 0;
const FEATURE_CONTROL_VMX_OUTSIDE_SMX: u64 = 1 << 2;
/// IA32_FEATURE_CONTROL[20]：LMCE使能
const FEATURE_CONTROL_LMCE: u64 = 1 << 20;

/// IA32_MCG_CAP的能力位
const MCG_CAP_BANK_COUNT_MASK: u64 = 0xFF;
const MCG_CAP_CMCI_P: u64 = 1 << 10;
const MCG_CAP_SER_P: u64 = 1 << 24;
const MCG_CAP_LMCE_P: u64 = 1 << 27;

/// IA32_CORE_CAPABILITIES（x86 crate未收录）
const MSR_IA32_CORE_CAPABILITIES: u32 = 0xCF;

bitflags! {
    /// IA32_VMX_EPT_VPID_CAP的能力位
    pub struct VmxEptVpidCap: u64 {
        const EPT_EXECUTE_ONLY = 1 << 0;
        const EPT_PAGE_WALK_4 = 1 << 6;
        const EPTP_UC = 1 << 8;
        const EPTP_WB = 1 << 14;
        const EPT_2MB_PAGE = 1 << 16;
        const EPT_1GB_PAGE = 1 << 17;
        const INVEPT = 1 << 20;
        const EPT_AD = 1 << 21;
        const INVEPT_SINGLE_CONTEXT = 1 << 25;
        const INVEPT_GLOBAL_CONTEXT = 1 << 26;
        const INVVPID = 1 << 32;
        const INVVPID_INDIVIDUAL_ADDR = 1 << 40;
        const INVVPID_SINGLE_CONTEXT = 1 << 41;
        const INVVPID_GLOBAL_CONTEXT = 1 << 42;
    }
}

/// pin-based执行控制（IA32_VMX_PINBASED_CTLS允许位）
pub const VMX_PINBASED_CTLS_IRQ_EXIT: u32 = 1 << 0;
pub const VMX_PINBASED_CTLS_POSTED_INTR: u32 = 1 << 7;
/// 主处理器执行控制
pub const VMX_PROCBASED_CTLS_TSC_OFF: u32 = 1 << 3;
pub const VMX_PROCBASED_CTLS_TPR_SHADOW: u32 = 1 << 21;
pub const VMX_PROCBASED_CTLS_IO_BITMAP: u32 = 1 << 25;
pub const VMX_PROCBASED_CTLS_MSR_BITMAP: u32 = 1 << 28;
pub const VMX_PROCBASED_CTLS_SECONDARY: u32 = 1 << 31;
/// 次级处理器执行控制
pub const VMX_PROCBASED_CTLS2_VAPIC: u32 = 1 << 0;
pub const VMX_PROCBASED_CTLS2_EPT: u32 = 1 << 1;
pub const VMX_PROCBASED_CTLS2_RDTSCP: u32 = 1 << 3;
pub const VMX_PROCBASED_CTLS2_VX2APIC: u32 = 1 << 4;
pub const VMX_PROCBASED_CTLS2_VPID: u32 = 1 << 5;
pub const VMX_PROCBASED_CTLS2_UNRESTRICT: u32 = 1 << 7;
pub const VMX_PROCBASED_CTLS2_VAPIC_REGS: u32 = 1 << 8;
pub const VMX_PROCBASED_CTLS2_VIRQ: u32 = 1 << 9;

/// CPUID寄存器槽位 + VMX能力MSR的只读快照
#[derive(Debug, Clone, Default)]
pub struct CpuCapabilities {
    pub family: u8,
    pub model: u8,
    pub cpuid_level: u32,
    pub extended_cpuid_level: u32,
    pub cpuid_leaves: [u32; FEATURE_WORDS],
    pub phys_bits: u8,
    pub virt_bits: u8,
    pub physical_address_mask: u64,

    pub vmx_basic: u64,
    pub vmx_pinbased: u64,
    pub vmx_procbased: u64,
    pub vmx_procbased2: u64,
    pub vmx_exit: u64,
    pub vmx_entry: u64,
    pub vmx_ept_vpid: u64,
    pub vmx_misc: u64,

    pub feature_control: u64,
    pub mcg_cap: u64,
    pub core_cap: u64,
}

impl CpuCapabilities {
    /// 查询打包的特性编号
    #[inline]
    pub fn has_cap(&self, bit: u32) -> bool {
        let word = (bit >> 5) as usize;
        let bit_in_word = bit & 0x1F;
        if word >= FEATURE_WORDS {
            return false;
        }
        return self.cpuid_leaves[word] & (1 << bit_in_word) != 0;
    }

    /// allowed-1约定：只有当`mask`的每一位在能力MSR的高32位中
    /// 都被置位时，这些控制位才允许被设置
    #[inline]
    pub fn is_ctrl_setting_allowed(msr_val: u64, mask: u32) -> bool {
        return ((msr_val >> 32) as u32) & mask == mask;
    }

    pub fn has_vmx_ept_vpid_cap(&self, mask: VmxEptVpidCap) -> bool {
        return VmxEptVpidCap::from_bits_truncate(self.vmx_ept_vpid).contains(mask);
    }

    pub fn has_core_cap(&self, mask: u64) -> bool {
        return self.core_cap & mask == mask;
    }

    /// Apollo Lake平台
    pub fn is_apl_platform(&self) -> bool {
        return self.family == 6 && self.model == 0x5C;
    }

    /// MONITOR/MWAIT可用。APL上的MONITOR有勘误，视为不可用
    pub fn has_monitor_cap(&self) -> bool {
        return self.has_cap(X86_FEATURE_MONITOR) && !self.is_apl_platform();
    }

    pub fn is_vmx_supported(&self) -> bool {
        return self.has_cap(X86_FEATURE_VMX);
    }

    /// VMX已在IA32_FEATURE_CONTROL中锁定使能
    pub fn is_vmx_enabled(&self) -> bool {
        return self.feature_control & (FEATURE_CONTROL_LOCK | FEATURE_CONTROL_VMX_OUTSIDE_SMX)
            == (FEATURE_CONTROL_LOCK | FEATURE_CONTROL_VMX_OUTSIDE_SMX);
    }

    pub fn is_ept_supported(&self) -> bool {
        return Self::is_ctrl_setting_allowed(self.vmx_procbased, VMX_PROCBASED_CTLS_SECONDARY)
            && Self::is_ctrl_setting_allowed(self.vmx_procbased2, VMX_PROCBASED_CTLS2_EPT);
    }

    /// APICv基础能力：TPR shadow + APIC访问虚拟化 + x2APIC虚拟化
    pub fn is_apicv_basic_feature_supported(&self) -> bool {
        return Self::is_ctrl_setting_allowed(self.vmx_procbased, VMX_PROCBASED_CTLS_TPR_SHADOW)
            && Self::is_ctrl_setting_allowed(self.vmx_procbased2, VMX_PROCBASED_CTLS2_VAPIC)
            && Self::is_ctrl_setting_allowed(self.vmx_procbased2, VMX_PROCBASED_CTLS2_VX2APIC);
    }

    /// APICv高级能力：基础能力 + 寄存器虚拟化 + 虚拟中断投递 + posted interrupt
    pub fn is_apicv_advanced_feature_supported(&self) -> bool {
        return self.is_apicv_basic_feature_supported()
            && Self::is_ctrl_setting_allowed(self.vmx_procbased2, VMX_PROCBASED_CTLS2_VAPIC_REGS)
            && Self::is_ctrl_setting_allowed(self.vmx_procbased2, VMX_PROCBASED_CTLS2_VIRQ)
            && Self::is_ctrl_setting_allowed(self.vmx_pinbased, VMX_PINBASED_CTLS_POSTED_INTR);
    }

    pub fn is_cmci_supported(&self) -> bool {
        return self.mcg_cap & MCG_CAP_CMCI_P != 0;
    }

    /// 本地机器检查（LMCE）：硬件具备且固件已使能
    pub fn is_local_mc_supported(&self) -> bool {
        return self.mcg_cap & MCG_CAP_LMCE_P != 0
            && self.feature_control & FEATURE_CONTROL_LMCE != 0;
    }

    pub fn is_sw_error_recovery_supported(&self) -> bool {
        return self.mcg_cap & MCG_CAP_SER_P != 0;
    }

    pub fn mc_bank_count(&self) -> u8 {
        return (self.mcg_cap & MCG_CAP_BANK_COUNT_MASK) as u8;
    }

    /// 启动必需的硬件能力检查。缺一不可
    pub fn detect_essential(&self) -> Result<(), SystemError> {
        struct Check(&'static str, bool);
        let checks = [
            Check("long mode", self.has_cap(X86_FEATURE_LM)),
            Check("SMEP", self.has_cap(X86_FEATURE_SMEP)),
            Check("SMAP", self.has_cap(X86_FEATURE_SMAP)),
            Check("NX", self.has_cap(X86_FEATURE_NX)),
            Check("MTRR", self.has_cap(X86_FEATURE_MTRR)),
            Check("CLFLUSHOPT", self.has_cap(X86_FEATURE_CLFLUSHOPT)),
            Check("VMX", self.is_vmx_supported()),
            Check("VMX enabled in IA32_FEATURE_CONTROL", self.is_vmx_enabled()),
            Check("x2APIC", self.has_cap(X86_FEATURE_X2APIC)),
            Check("POPCNT", self.has_cap(X86_FEATURE_POPCNT)),
            Check("SSE", self.has_cap(X86_FEATURE_SSE)),
            Check("RDRAND", self.has_cap(X86_FEATURE_RDRAND)),
            Check(
                "fast string + ERMS",
                self.has_cap(X86_FEATURE_FAST_STRING) && self.has_cap(X86_FEATURE_ERMS),
            ),
            Check("EPT", self.is_ept_supported()),
            Check("APICv basic", self.is_apicv_basic_feature_supported()),
            Check("CPUID level >= 0x15", self.cpuid_level >= 0x15),
            Check(
                "physical address width",
                self.phys_bits != 0 && self.phys_bits <= MAXIMUM_PA_WIDTH,
            ),
            Check(
                "1GB large page",
                self.phys_bits <= 39 || self.has_cap(X86_FEATURE_PAGE1GB),
            ),
            Check(
                "INVEPT",
                self.has_vmx_ept_vpid_cap(VmxEptVpidCap::INVEPT),
            ),
            Check(
                "INVVPID",
                self.has_vmx_ept_vpid_cap(VmxEptVpidCap::INVVPID),
            ),
            Check(
                "EPT 2MB page",
                self.has_vmx_ept_vpid_cap(VmxEptVpidCap::EPT_2MB_PAGE),
            ),
            Check(
                "unrestricted guest",
                Self::is_ctrl_setting_allowed(self.vmx_procbased2, VMX_PROCBASED_CTLS2_UNRESTRICT),
            ),
            Check(
                "64-bit VMX structures",
                self.vmx_basic & VMX_BASIC_ADDR_WIDTH_32 == 0,
            ),
            Check(
                "required VMX controls",
                Self::is_ctrl_setting_allowed(self.vmx_pinbased, VMX_PINBASED_CTLS_IRQ_EXIT)
                    && Self::is_ctrl_setting_allowed(
                        self.vmx_procbased,
                        VMX_PROCBASED_CTLS_MSR_BITMAP
                            | VMX_PROCBASED_CTLS_IO_BITMAP
                            | VMX_PROCBASED_CTLS_TSC_OFF
                            | VMX_PROCBASED_CTLS_SECONDARY,
                    )
                    && Self::is_ctrl_setting_allowed(
                        self.vmx_procbased2,
                        VMX_PROCBASED_CTLS2_VPID | VMX_PROCBASED_CTLS2_RDTSCP,
                    ),
            ),
        ];

        let mut ok = true;
        for Check(name, passed) in checks.iter() {
            if !passed {
                error!("detect_hardware_support: {} is not supported", name);
                ok = false;
            }
        }
        if ok {
            return Ok(());
        }
        return Err(SystemError::ENODEV);
    }
}

static mut BOOT_CPU_DATA: Option<CpuCapabilities> = None;

/// 在BSP上读取CPUID/MSR，填充能力登记表。只能调用一次
#[inline(never)]
pub fn init_pcpu_capabilities() {
    let caps = read_cpu_capabilities();
    unsafe {
        debug_assert!(BOOT_CPU_DATA.is_none());
        BOOT_CPU_DATA = Some(caps);
    }
}

/// 测试/模拟环境下直接注入能力表
#[cfg(test)]
pub fn init_pcpu_capabilities_from(caps: CpuCapabilities) {
    unsafe {
        BOOT_CPU_DATA = Some(caps);
    }
}

/// 获取能力登记表。必须先完成`init_pcpu_capabilities`
#[inline(always)]
pub fn cpu_caps() -> &'static CpuCapabilities {
    unsafe {
        BOOT_CPU_DATA
            .as_ref()
            .expect("cpu capabilities not initialized")
    }
}

pub fn pcpu_has_cap(bit: u32) -> bool {
    return cpu_caps().has_cap(bit);
}

pub fn has_core_cap(mask: u64) -> bool {
    return cpu_caps().has_core_cap(mask);
}

pub fn pcpu_has_vmx_ept_vpid_cap(mask: VmxEptVpidCap) -> bool {
    return cpu_caps().has_vmx_ept_vpid_cap(mask);
}

/// 检查所有必需的硬件能力，失败意味着无法启动
pub fn detect_hardware_support() -> Result<(), SystemError> {
    return cpu_caps().detect_essential();
}

pub fn is_apl_platform() -> bool {
    return cpu_caps().is_apl_platform();
}

pub fn has_monitor_cap() -> bool {
    return cpu_caps().has_monitor_cap();
}

pub fn is_apicv_basic_feature_supported() -> bool {
    return cpu_caps().is_apicv_basic_feature_supported();
}

pub fn is_apicv_advanced_feature_supported() -> bool {
    return cpu_caps().is_apicv_advanced_feature_supported();
}

pub fn is_cmci_supported() -> bool {
    return cpu_caps().is_cmci_supported();
}

pub fn is_local_mc_supported() -> bool {
    return cpu_caps().is_local_mc_supported();
}

pub fn is_sw_error_recovery_supported() -> bool {
    return cpu_caps().is_sw_error_recovery_supported();
}

pub fn mc_bank_count() -> u8 {
    return cpu_caps().mc_bank_count();
}

fn read_cpu_capabilities() -> CpuCapabilities {
    let mut caps = CpuCapabilities::default();
    let cpuid = raw_cpuid::CpuId::new();

    if let Some(feat) = cpuid.get_feature_info() {
        caps.family = feat.family_id();
        caps.model = feat.model_id();
        // raw-cpuid已经把extended model并进model_id
        caps.cpuid_leaves[FEAT_1_ECX as usize] = unsafe { raw_leaf(1).ecx };
        caps.cpuid_leaves[FEAT_1_EDX as usize] = unsafe { raw_leaf(1).edx };
    }
    unsafe {
        caps.cpuid_level = raw_leaf(0).eax;
        let leaf7 = raw_leaf_sub(7, 0);
        caps.cpuid_leaves[FEAT_7_0_EBX as usize] = leaf7.ebx;
        caps.cpuid_leaves[FEAT_7_0_ECX as usize] = leaf7.ecx;
        caps.cpuid_leaves[FEAT_7_0_EDX as usize] = leaf7.edx;
        caps.cpuid_leaves[FEAT_D_1_EAX as usize] = raw_leaf_sub(0xD, 1).eax;

        caps.extended_cpuid_level = raw_leaf(0x8000_0000).eax;
        if caps.extended_cpuid_level >= 0x8000_0001 {
            let leaf = raw_leaf(0x8000_0001);
            caps.cpuid_leaves[FEAT_8000_0001_ECX as usize] = leaf.ecx;
            caps.cpuid_leaves[FEAT_8000_0001_EDX as usize] = leaf.edx;
        }
        if caps.extended_cpuid_level >= 0x8000_0007 {
            caps.cpuid_leaves[FEAT_8000_0007_EDX as usize] = raw_leaf(0x8000_0007).edx;
        }
        if caps.extended_cpuid_level >= 0x8000_0008 {
            let leaf = raw_leaf(0x8000_0008);
            caps.cpuid_leaves[FEAT_8000_0008_EBX as usize] = leaf.ebx;
            caps.phys_bits = (leaf.eax & 0xFF) as u8;
            caps.virt_bits = ((leaf.eax >> 8) & 0xFF) as u8;
            if caps.phys_bits != 0 && caps.phys_bits <= MAXIMUM_PA_WIDTH {
                caps.physical_address_mask =
                    ((1u64 << caps.phys_bits) - 1) & !((1u64 << 12) - 1);
            }
        }
    }

    // VMX/MCG/core能力只有裸机上能读
    #[cfg(target_os = "none")]
    if caps.is_vmx_supported() {
        use x86::msr;
        unsafe {
            caps.vmx_basic = msr::rdmsr(msr::IA32_VMX_BASIC);
            caps.vmx_pinbased = msr::rdmsr(msr::IA32_VMX_PINBASED_CTLS);
            caps.vmx_procbased = msr::rdmsr(msr::IA32_VMX_PROCBASED_CTLS);
            caps.vmx_procbased2 = msr::rdmsr(msr::IA32_VMX_PROCBASED_CTLS2);
            caps.vmx_exit = msr::rdmsr(msr::IA32_VMX_EXIT_CTLS);
            caps.vmx_entry = msr::rdmsr(msr::IA32_VMX_ENTRY_CTLS);
            caps.vmx_ept_vpid = msr::rdmsr(msr::IA32_VMX_EPT_VPID_CAP);
            caps.vmx_misc = msr::rdmsr(msr::IA32_VMX_MISC);
            caps.feature_control = msr::rdmsr(msr::IA32_FEATURE_CONTROL);
        }
    }
    #[cfg(target_os = "none")]
    unsafe {
        use x86::msr;
        if caps.has_cap(X86_FEATURE_MCE) && caps.has_cap(X86_FEATURE_MCA) {
            caps.mcg_cap = msr::rdmsr(msr::IA32_MCG_CAP);
        }
        if caps.has_cap(X86_FEATURE_CORE_CAPABILITY) {
            caps.core_cap = msr::rdmsr(MSR_IA32_CORE_CAPABILITIES);
        }
    }

    return caps;
}

/// 直接执行CPUID指令读取一个叶子
unsafe fn raw_leaf(leaf: u32) -> ::core::arch::x86_64::CpuidResult {
    return raw_leaf_sub(leaf, 0);
}

unsafe fn raw_leaf_sub(leaf: u32, subleaf: u32) -> ::core::arch::x86_64::CpuidResult {
    return ::core::arch::x86_64::__cpuid_count(leaf, subleaf);
}
