//! 启动期的页帧bump分配器
//!
//! 页表页在启动阶段成批建立、几乎不回收，从一段预留的
//! 物理内存里线性切页就能满足需要。回收的页帧进入一个
//! 简单的空闲链（单个usize栈，存放在被释放页自身头部）。

use log::debug;

use crate::mm::allocator::page_frame::FrameAllocator;
use crate::mm::{MemoryManagementArch, MMArch, PhysAddr};

#[derive(Debug)]
pub struct BumpFrameAllocator {
    next: PhysAddr,
    end: PhysAddr,
    /// 空闲链头。0表示链空
    free_head: usize,
}

impl BumpFrameAllocator {
    /// 在物理区间`[start, end)`上创建分配器。区间必须按页对齐
    pub fn new(start: PhysAddr, end: PhysAddr) -> Self {
        debug_assert!(start.check_aligned(MMArch::PAGE_SIZE));
        debug_assert!(end.check_aligned(MMArch::PAGE_SIZE));
        Self {
            next: start,
            end,
            free_head: 0,
        }
    }

    /// 剩余可分配的页数（不含空闲链）
    pub fn remaining(&self) -> usize {
        (self.end.data() - self.next.data()) >> MMArch::PAGE_SHIFT
    }
}

impl FrameAllocator for BumpFrameAllocator {
    unsafe fn allocate_one(&mut self) -> Option<PhysAddr> {
        // 优先复用空闲链上的页
        if self.free_head != 0 {
            let page = PhysAddr::new(self.free_head);
            let virt = MMArch::phys_2_virt(page)?;
            self.free_head = MMArch::read::<usize>(virt);
            MMArch::write_bytes(virt, 0, MMArch::PAGE_SIZE);
            return Some(page);
        }

        if self.next.data() >= self.end.data() {
            debug!("BumpFrameAllocator: exhausted at {:?}", self.end);
            return None;
        }
        let page = self.next;
        self.next = self.next.add(MMArch::PAGE_SIZE);
        let virt = MMArch::phys_2_virt(page)?;
        MMArch::write_bytes(virt, 0, MMArch::PAGE_SIZE);
        return Some(page);
    }

    unsafe fn free_one(&mut self, address: PhysAddr) {
        let virt = match MMArch::phys_2_virt(address) {
            Some(v) => v,
            None => return,
        };
        MMArch::write::<usize>(virt, self.free_head);
        self.free_head = address.data();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::mm::build_host_page_table;
    use crate::mm::VirtAddr;
    use ::core::alloc::Layout;

    /// 在宿主机上用一段堆内存扮演预留的物理区间
    fn heap_region(pages: usize) -> (PhysAddr, PhysAddr) {
        let layout = Layout::from_size_align(pages * 4096, 4096).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        (
            PhysAddr::new(ptr as usize),
            PhysAddr::new(ptr as usize + pages * 4096),
        )
    }

    #[test]
    fn test_bump_alloc_and_reuse() {
        let (start, end) = heap_region(4);
        let mut allocator = BumpFrameAllocator::new(start, end);
        assert_eq!(allocator.remaining(), 4);

        let a = unsafe { allocator.allocate_one() }.unwrap();
        let b = unsafe { allocator.allocate_one() }.unwrap();
        assert_eq!(b.data(), a.data() + 4096);

        // 释放的页进空闲链，优先复用
        unsafe { allocator.free_one(a) };
        let c = unsafe { allocator.allocate_one() }.unwrap();
        assert_eq!(c, a);

        unsafe {
            allocator.allocate_one().unwrap();
            allocator.allocate_one().unwrap();
        }
        assert!(unsafe { allocator.allocate_one() }.is_none());
    }

    #[test]
    fn test_host_page_table_construction() {
        // 64MiB的直映射走2M大页：root/L3/L2各一页就够了
        let (start, end) = heap_region(8);
        let mapper = build_host_page_table(start, end, 64 * 1024 * 1024).unwrap();

        let va = VirtAddr::new(crate::arch::mm::X86_64MMArch::PHYS_OFFSET + 0x123000);
        let (entry, size) = mapper.lookup_entry(va).unwrap();
        let base = (entry & crate::mm::MMArch::ENTRY_ADDRESS_MASK) as usize;
        assert_eq!(base + (va.data() & (size - 1)), 0x123000);
    }
}
