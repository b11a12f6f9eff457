use ::core::sync::atomic::{AtomicU8, Ordering};

use crate::mm::page::{LargePageLevel, PageMapper, PagingFlavor};
use crate::mm::VirtAddr;

bitflags! {
    /// EPT页表项的属性位
    pub struct EptFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// 内存类型字段（bit 5:3）
        const MEM_TYPE_MASK = 0x7 << 3;
        const MEM_TYPE_WB = 6 << 3;
        const IGNORE_PAT = 1 << 6;
        const HUGE_PAGE = 1 << 7;
    }
}

impl EptFlags {
    /// 普通RAM映射的默认属性：RWX + 写回 + 忽略PAT
    pub fn rwx_wb() -> EptFlags {
        EptFlags::READ
            | EptFlags::WRITE
            | EptFlags::EXECUTE
            | EptFlags::MEM_TYPE_WB
            | EptFlags::IGNORE_PAT
    }
}

/// 平台支持的EPT大页档位，启动时从VMX能力MSR里读出。
/// 默认按全支持处理（detect_hardware_support已经强制EPT 2MB）。
static EPT_LARGE_PAGE_CAPS: AtomicU8 = AtomicU8::new(0b11);

const CAP_2M: u8 = 1 << 0;
const CAP_1G: u8 = 1 << 1;

/// 根据能力登记表配置EPT大页支持。BSP初始化路径调用
pub fn init_ept_large_page_caps() {
    use crate::arch::cpu::capability::{cpu_caps, VmxEptVpidCap};
    let mut caps = 0u8;
    if cpu_caps().has_vmx_ept_vpid_cap(VmxEptVpidCap::EPT_2MB_PAGE) {
        caps |= CAP_2M;
    }
    if cpu_caps().has_vmx_ept_vpid_cap(VmxEptVpidCap::EPT_1GB_PAGE) {
        caps |= CAP_1G;
    }
    EPT_LARGE_PAGE_CAPS.store(caps, Ordering::Release);
}

/// guest EPT的分页flavor
///
/// 与宿主机MMU的差别：存在性由RWX三位决定；大页叶子建立时
/// 去掉执行权限，拆回小页时恢复（大页上的可执行映射才是
/// 需要防的东西，4K粒度的执行权限由上层按段精确给出）。
#[derive(Debug, Clone, Copy)]
pub struct EptPagingFlavor;

impl PagingFlavor for EptPagingFlavor {
    const PROT_MASK: u64 = EptFlags::READ.bits()
        | EptFlags::WRITE.bits()
        | EptFlags::EXECUTE.bits()
        | EptFlags::MEM_TYPE_MASK.bits()
        | EptFlags::IGNORE_PAT.bits()
        | EptFlags::HUGE_PAGE.bits();

    /// 中间页表项只携带RWX，内存类型属于叶子
    const DEFAULT_TABLE_PROT: u64 =
        EptFlags::READ.bits() | EptFlags::WRITE.bits() | EptFlags::EXECUTE.bits();

    #[inline(always)]
    fn entry_present(entry: u64) -> bool {
        entry & (EptFlags::READ | EptFlags::WRITE | EptFlags::EXECUTE).bits() != 0
    }

    #[inline(always)]
    fn large_page_supported(level: LargePageLevel, _prot: u64) -> bool {
        let caps = EPT_LARGE_PAGE_CAPS.load(Ordering::Acquire);
        match level {
            LargePageLevel::Level2M => caps & CAP_2M != 0,
            LargePageLevel::Level1G => caps & CAP_1G != 0,
        }
    }

    #[inline(always)]
    fn tweak_exe_right(prot: u64) -> u64 {
        prot & !EptFlags::EXECUTE.bits()
    }

    #[inline(always)]
    fn recover_exe_right(prot: u64) -> u64 {
        prot | EptFlags::EXECUTE.bits()
    }

    #[inline(always)]
    fn flush_cacheline(entry_virt: VirtAddr) {
        // EPT遍历器不走一致性协议的平台上，页表项必须落到内存
        #[cfg(target_arch = "x86_64")]
        unsafe {
            ::core::arch::x86_64::_mm_clflush(entry_virt.data() as *const u8);
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = entry_virt;
    }
}

/// EPT页表映射器
///
/// 调用方（VM的内存管理路径）持有per-VM的ept锁，修改之后
/// 自行发INVEPT，映射器本身不做TLB失效。
pub type EptPageMapper<A> = PageMapper<EptPagingFlavor, A>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::allocator::page_frame::HeapFrameAllocator;
    use crate::mm::page::{PageModifyKind, PageTable, PageLevel};
    use crate::mm::{MemoryManagementArch, MMArch, PhysAddr, VirtAddr};

    fn new_mapper() -> EptPageMapper<HeapFrameAllocator> {
        PageMapper::create(HeapFrameAllocator::new()).unwrap()
    }

    #[test]
    fn test_scenario_one_gig_mapping() {
        // S1：1GiB映射正好放进pml4e[1]下面那张L3表的第0项
        let mut mapper = new_mapper();
        unsafe {
            mapper
                .add_map(
                    VirtAddr::new(0x80000000),
                    PhysAddr::new(0x80000000),
                    0x40000000,
                    EptFlags::rwx_wb().bits(),
                )
                .unwrap();
        }

        let (entry, size) = mapper.lookup_entry(VirtAddr::new(0x80001000)).unwrap();
        assert_eq!(size, 0x40000000);
        assert_eq!(entry & MMArch::ENTRY_ADDRESS_MASK, 0x80000000);
        // 大页叶子的执行权限被tweak掉
        assert_eq!(entry & EptFlags::EXECUTE.bits(), 0);
        assert_ne!(entry & EptFlags::HUGE_PAGE.bits(), 0);

        // 根页表里pml4e[0]不存在，gpa 0x80000000落在pml4e[0]的
        // 低512G里，其L3下标为2
        let root = mapper.table();
        let l4_index = root.index_of(VirtAddr::new(0x80000000));
        assert_eq!(l4_index, 0);
        let l4e = unsafe { root.entry(l4_index) }.unwrap();
        let l3 = PageTable::new(
            PhysAddr::new((l4e & MMArch::ENTRY_ADDRESS_MASK) as usize),
            PageLevel::Level1G,
        );
        assert_eq!(l3.index_of(VirtAddr::new(0x80000000)), 2);
    }

    #[test]
    fn test_scenario_split_preserves_base_and_recovers_exe() {
        // S2：删掉1G大页中间的2MiB，剩下511个2M叶子，
        // 且拆分时恢复了执行权限
        let mut mapper = new_mapper();
        unsafe {
            mapper
                .add_map(
                    VirtAddr::new(0x80000000),
                    PhysAddr::new(0x80000000),
                    0x40000000,
                    EptFlags::rwx_wb().bits(),
                )
                .unwrap();
            mapper
                .modify_or_del_map(
                    VirtAddr::new(0x80200000),
                    0x200000,
                    0,
                    0,
                    PageModifyKind::Del,
                )
                .unwrap();
        }

        assert!(mapper.lookup_entry(VirtAddr::new(0x80200000)).is_none());
        for gpa in [0x80000000usize, 0x80400000, 0x80000000 + 0x3FE00000] {
            let (entry, size) = mapper.lookup_entry(VirtAddr::new(gpa)).unwrap();
            assert_eq!(size, 0x200000);
            assert_eq!(entry & MMArch::ENTRY_ADDRESS_MASK, gpa as u64);
            // recover_exe_right：2M后继叶子拿回执行权限
            assert_ne!(entry & EptFlags::EXECUTE.bits(), 0);
            assert_ne!(entry & EptFlags::HUGE_PAGE.bits(), 0);
        }
        // 没有满足回收条件的页表页
        assert_eq!(mapper.allocator_mut().freed(), 0);
    }

    #[test]
    fn test_vocabulary_enforced() {
        let mut mapper = new_mapper();
        // 宿主机MMU的NX位不在EPT的词汇表里
        let err = unsafe {
            mapper.add_map(
                VirtAddr::new(0x1000),
                PhysAddr::new(0x1000),
                0x1000,
                EptFlags::READ.bits() | (1 << 63),
            )
        };
        assert!(err.is_err());
    }
}
