//! 早期内存分配器
//!
//! 裸机环境下，堆分配（描述符表、位图等）都很小且基本不释放，
//! 一个只进不出的bump分配器就足够了。宿主机构建时std自带
//! 分配器，这里整个模块是空操作。

use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicUsize, Ordering};

/// 早期堆的大小
const EARLY_HEAP_SIZE: usize = 4 * 1024 * 1024;

#[repr(align(4096))]
struct EarlyHeap([u8; EARLY_HEAP_SIZE]);

static mut EARLY_HEAP: EarlyHeap = EarlyHeap([0; EARLY_HEAP_SIZE]);
static EARLY_HEAP_OFFSET: AtomicUsize = AtomicUsize::new(0);

pub struct EarlyAllocator;

impl EarlyAllocator {
    /// 已经分配出去的字节数
    pub fn used() -> usize {
        EARLY_HEAP_OFFSET.load(Ordering::Relaxed)
    }

    fn alloc_inner(layout: Layout) -> *mut u8 {
        let align = layout.align().max(core::mem::size_of::<usize>());
        let mut old = EARLY_HEAP_OFFSET.load(Ordering::Relaxed);
        loop {
            let base = unsafe { core::ptr::addr_of!(EARLY_HEAP) as usize };
            let start = (base + old + align - 1) & !(align - 1);
            let new = start - base + layout.size();
            if new > EARLY_HEAP_SIZE {
                return core::ptr::null_mut();
            }
            match EARLY_HEAP_OFFSET.compare_exchange_weak(
                old,
                new,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return start as *mut u8,
                Err(cur) => old = cur,
            }
        }
    }
}

unsafe impl GlobalAlloc for EarlyAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        Self::alloc_inner(layout)
    }

    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {
        // bump分配器不回收单个对象
    }
}
