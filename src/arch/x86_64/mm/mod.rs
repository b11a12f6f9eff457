use system_error::SystemError;

use crate::mm::page::{LargePageLevel, PagingFlavor};
use crate::mm::{MemoryManagementArch, PhysAddr, VirtAddr};

pub mod bump;

/// x86_64的内存管理架构
#[derive(Debug, Clone, Copy)]
pub struct X86_64MMArch;

impl X86_64MMArch {
    /// 物理内存直映射区的起始虚拟地址
    pub const PHYS_OFFSET: usize = 0xFFFF_8000_0000_0000;
}

impl MemoryManagementArch for X86_64MMArch {
    const PAGE_SHIFT: usize = 12;
    const PAGE_ENTRY_SHIFT: usize = 9;

    #[inline(always)]
    unsafe fn phys_2_virt(phys: PhysAddr) -> Option<VirtAddr> {
        // 裸机上物理内存整体被直映射到PHYS_OFFSET之后；
        // 宿主机（单元测试）里页帧就是堆内存，恒等映射。
        #[cfg(target_os = "none")]
        {
            return phys
                .data()
                .checked_add(Self::PHYS_OFFSET)
                .map(VirtAddr::new);
        }
        #[cfg(not(target_os = "none"))]
        {
            return Some(VirtAddr::new(phys.data()));
        }
    }

    #[inline(always)]
    unsafe fn virt_2_phys(virt: VirtAddr) -> Option<PhysAddr> {
        #[cfg(target_os = "none")]
        {
            return virt
                .data()
                .checked_sub(Self::PHYS_OFFSET)
                .map(PhysAddr::new);
        }
        #[cfg(not(target_os = "none"))]
        {
            return Some(PhysAddr::new(virt.data()));
        }
    }
}

bitflags! {
    /// IA-32e分页结构的属性位
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const READ_WRITE = 1 << 1;
        const USER_SUPERVISOR = 1 << 2;
        const PAGE_WRITE_THROUGH = 1 << 3;
        const PAGE_CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const PAGE_SIZE = 1 << 7;
        const GLOBAL = 1 << 8;
        const PAT_LARGE = 1 << 12;
        const EXECUTE_DISABLE = 1 << 63;
    }
}

/// 宿主机MMU的分页flavor
///
/// hypervisor自身的页表。执行权限不做tweak（宿主机代码页
/// 的NX由映射时的属性直接决定）。
#[derive(Debug, Clone, Copy)]
pub struct X86PagingFlavor;

impl PagingFlavor for X86PagingFlavor {
    const PROT_MASK: u64 = PageFlags::PRESENT.bits()
        | PageFlags::READ_WRITE.bits()
        | PageFlags::USER_SUPERVISOR.bits()
        | PageFlags::PAGE_WRITE_THROUGH.bits()
        | PageFlags::PAGE_CACHE_DISABLE.bits()
        | PageFlags::ACCESSED.bits()
        | PageFlags::DIRTY.bits()
        | PageFlags::PAGE_SIZE.bits()
        | PageFlags::GLOBAL.bits()
        | PageFlags::PAT_LARGE.bits()
        | PageFlags::EXECUTE_DISABLE.bits();

    const DEFAULT_TABLE_PROT: u64 = PageFlags::PRESENT.bits()
        | PageFlags::READ_WRITE.bits()
        | PageFlags::USER_SUPERVISOR.bits();

    #[inline(always)]
    fn entry_present(entry: u64) -> bool {
        entry & PageFlags::PRESENT.bits() != 0
    }

    #[inline(always)]
    fn large_page_supported(level: LargePageLevel, _prot: u64) -> bool {
        match level {
            LargePageLevel::Level2M => true,
            // 1G大页依赖CPUID.80000001H:EDX[26]，启动时已由
            // detect_hardware_support把关
            LargePageLevel::Level1G => true,
        }
    }

    #[inline(always)]
    fn tweak_exe_right(prot: u64) -> u64 {
        prot
    }

    #[inline(always)]
    fn recover_exe_right(prot: u64) -> u64 {
        prot
    }

    #[inline(always)]
    fn flush_cacheline(_entry_virt: VirtAddr) {
        // 宿主机页表和页表遍历器在同一个缓存一致域内
    }
}

/// 为hypervisor自身建立地址空间
///
/// 把`[0, ram_size)`的物理内存直映射到`PHYS_OFFSET`之后，
/// 页表页取自`[pool_start, pool_end)`的预留区。返回的mapper
/// 即宿主机MMU的所有者，根页表随后装入CR3。
pub fn build_host_page_table(
    pool_start: PhysAddr,
    pool_end: PhysAddr,
    ram_size: usize,
) -> Result<crate::mm::page::PageMapper<X86PagingFlavor, bump::BumpFrameAllocator>, SystemError> {
    use crate::mm::page::PageMapper;

    let allocator = bump::BumpFrameAllocator::new(pool_start, pool_end);
    let mut mapper = PageMapper::create(allocator).ok_or(SystemError::ENOMEM)?;
    let prot = PageFlags::PRESENT
        | PageFlags::READ_WRITE
        | PageFlags::GLOBAL
        | PageFlags::EXECUTE_DISABLE;
    unsafe {
        mapper.add_map(
            VirtAddr::new(X86_64MMArch::PHYS_OFFSET),
            PhysAddr::new(0),
            ram_size,
            prot.bits(),
        )?;
    }
    return Ok(mapper);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::allocator::page_frame::HeapFrameAllocator;
    use crate::mm::page::PageMapper;

    #[test]
    fn test_host_mmu_vocabulary() {
        let mut mapper: PageMapper<X86PagingFlavor, _> =
            PageMapper::create(HeapFrameAllocator::new()).unwrap();
        // bit9是IA-32e的ignored位，不在词汇表里
        let err = unsafe {
            mapper.add_map(
                VirtAddr::new(0x1000),
                PhysAddr::new(0x1000),
                0x1000,
                PageFlags::PRESENT.bits() | (1 << 9),
            )
        };
        assert!(err.is_err());

        unsafe {
            mapper
                .add_map(
                    VirtAddr::new(0x1000),
                    PhysAddr::new(0x1000),
                    0x1000,
                    (PageFlags::PRESENT | PageFlags::READ_WRITE | PageFlags::EXECUTE_DISABLE)
                        .bits(),
                )
                .unwrap();
        }
        let (entry, size) = mapper.lookup_entry(VirtAddr::new(0x1000)).unwrap();
        assert_eq!(size, 0x1000);
        assert_ne!(entry & PageFlags::EXECUTE_DISABLE.bits(), 0);
    }
}
