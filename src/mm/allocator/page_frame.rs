use crate::mm::PhysAddr;

/// 页帧分配器
///
/// 页表引擎通过这个trait申请/归还页表页。裸机上由
/// bump分配器实现（见`arch::mm::bump`），单元测试里由
/// [`HeapFrameAllocator`]实现。
pub trait FrameAllocator {
    /// 分配一个4KiB页帧
    ///
    /// ## Safety
    ///
    /// 调用者需要保证返回的页帧只被一个所有者使用
    unsafe fn allocate_one(&mut self) -> Option<PhysAddr>;

    /// 释放一个页帧
    ///
    /// ## Safety
    ///
    /// `address`必须来自同一个分配器的`allocate_one`
    unsafe fn free_one(&mut self, address: PhysAddr);
}

impl<T: FrameAllocator + ?Sized> FrameAllocator for &mut T {
    unsafe fn allocate_one(&mut self) -> Option<PhysAddr> {
        (**self).allocate_one()
    }

    unsafe fn free_one(&mut self, address: PhysAddr) {
        (**self).free_one(address);
    }
}

/// 宿主机测试用的页帧分配器：从堆上切出4KiB对齐的页帧，
/// 配合恒等映射的`MMArch`让页表引擎在用户态可跑。
#[cfg(test)]
pub struct HeapFrameAllocator {
    allocated: hashbrown::HashSet<usize>,
    freed: usize,
}

#[cfg(test)]
impl Default for HeapFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl HeapFrameAllocator {
    pub fn new() -> Self {
        Self {
            allocated: hashbrown::HashSet::new(),
            freed: 0,
        }
    }

    /// 仍未归还的页帧数量
    pub fn outstanding(&self) -> usize {
        self.allocated.len()
    }

    /// 已经归还的页帧数量
    pub fn freed(&self) -> usize {
        self.freed
    }
}

#[cfg(test)]
impl FrameAllocator for HeapFrameAllocator {
    unsafe fn allocate_one(&mut self) -> Option<PhysAddr> {
        use core::alloc::Layout;
        let layout = Layout::from_size_align(4096, 4096).unwrap();
        let ptr = std::alloc::alloc_zeroed(layout);
        if ptr.is_null() {
            return None;
        }
        self.allocated.insert(ptr as usize);
        Some(PhysAddr::new(ptr as usize))
    }

    unsafe fn free_one(&mut self, address: PhysAddr) {
        use core::alloc::Layout;
        assert!(
            self.allocated.remove(&address.data()),
            "free_one: {:?} was not allocated by this allocator",
            address
        );
        self.freed += 1;
        let layout = Layout::from_size_align(4096, 4096).unwrap();
        std::alloc::dealloc(address.data() as *mut u8, layout);
    }
}
