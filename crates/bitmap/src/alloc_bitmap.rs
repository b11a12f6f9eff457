use alloc::vec::Vec;

use crate::{bitmap_core::BitMapCore, traits::BitMapOps};

/// 堆上分配的位图
///
/// 存储单元为u64，位序为小端（第i位在第i/8个字节的第i%8位），
/// 因此`as_bytes`得到的内存布局与硬件位图（例如MSR bitmap页）一致。
#[derive(Debug, Clone)]
pub struct AllocBitmap {
    elements: usize,
    data: Vec<u64>,
    core: BitMapCore<u64>,
}

impl AllocBitmap {
    pub fn new(elements: usize) -> Self {
        let data = alloc::vec![0u64; (elements + 63) / 64];
        Self {
            elements,
            data,
            core: BitMapCore::new(),
        }
    }

    /// 以u64切片的形式访问位图数据
    pub fn data(&self) -> &[u64] {
        &self.data
    }
}

impl BitMapOps<u64> for AllocBitmap {
    #[inline]
    fn get(&self, index: usize) -> Option<bool> {
        return self.core.get(self.elements, &self.data, index);
    }

    #[inline]
    fn set(&mut self, index: usize, value: bool) -> Option<bool> {
        return self.core.set(self.elements, &mut self.data, index, value);
    }

    #[inline]
    fn len(&self) -> usize {
        self.elements
    }

    #[inline]
    fn size(&self) -> usize {
        self.data.len() * core::mem::size_of::<u64>()
    }

    #[inline]
    fn first_index(&self) -> Option<usize> {
        self.core.first_index(&self.data)
    }

    #[inline]
    fn first_false_index(&self) -> Option<usize> {
        self.core.first_false_index(self.elements, &self.data)
    }

    #[inline]
    fn last_index(&self) -> Option<usize> {
        self.core.last_index(self.elements, &self.data)
    }

    #[inline]
    fn next_index(&self, index: usize) -> Option<usize> {
        self.core.next_index(self.elements, &self.data, index)
    }

    #[inline]
    fn next_false_index(&self, index: usize) -> Option<usize> {
        self.core.next_false_index(self.elements, &self.data, index)
    }

    #[inline]
    fn count_ones(&self) -> usize {
        self.core.count_ones(self.elements, &self.data)
    }

    fn set_all(&mut self, value: bool) {
        self.core.set_all(self.elements, &mut self.data, value);
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(
                self.data.as_ptr() as *const u8,
                self.data.len() * core::mem::size_of::<u64>(),
            )
        }
    }
}
