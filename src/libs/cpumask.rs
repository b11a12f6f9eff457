use bitmap::{traits::BitMapOps, AllocBitmap};

use crate::mm::percpu::PerCpu;
use crate::smp::cpu::ProcessorId;

/// 处理器集合
#[derive(Clone)]
pub struct CpuMask {
    bmp: AllocBitmap,
}

#[allow(dead_code)]
impl CpuMask {
    pub fn new() -> Self {
        let bmp = AllocBitmap::new(PerCpu::MAX_CPU_NUM as usize);
        Self { bmp }
    }

    /// 设置指定cpu是否在集合中
    pub fn set(&mut self, cpu: ProcessorId, value: bool) -> Option<bool> {
        self.bmp.set(cpu.data() as usize, value)
    }

    /// 判断指定cpu是否在集合中
    pub fn contains(&self, cpu: ProcessorId) -> bool {
        self.bmp.get(cpu.data() as usize).unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.bmp.first_index().is_none()
    }

    /// 集合中的cpu数量
    pub fn count(&self) -> usize {
        self.bmp.count_ones()
    }

    /// 获取CpuMask中的第一个cpu
    pub fn first(&self) -> Option<ProcessorId> {
        self.bmp
            .first_index()
            .map(|index| ProcessorId::new(index as u32))
    }

    /// 获取CpuMask中第一个未被置位的cpu
    pub fn first_zero(&self) -> Option<ProcessorId> {
        self.bmp
            .first_false_index()
            .map(|index| ProcessorId::new(index as u32))
    }

    /// 获取指定cpu之后第一个为1的位的cpu
    pub fn next_index(&self, cpu: ProcessorId) -> Option<ProcessorId> {
        self.bmp
            .next_index(cpu.data() as usize)
            .map(|index| ProcessorId::new(index as u32))
    }

    /// 迭代所有被置位的cpu
    pub fn iter_cpu(&self) -> CpuMaskIter {
        CpuMaskIter {
            mask: self,
            index: None,
        }
    }
}

impl Default for CpuMask {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter_cpu()).finish()
    }
}

pub struct CpuMaskIter<'a> {
    mask: &'a CpuMask,
    index: Option<ProcessorId>,
}

impl Iterator for CpuMaskIter<'_> {
    type Item = ProcessorId;

    fn next(&mut self) -> Option<Self::Item> {
        let next = match self.index {
            None => self.mask.first(),
            Some(cpu) => self.mask.next_index(cpu),
        };
        self.index = next;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_iter() {
        let mut mask = CpuMask::new();
        assert!(mask.is_empty());
        mask.set(ProcessorId::new(1), true);
        mask.set(ProcessorId::new(3), true);
        mask.set(ProcessorId::new(5), true);

        let cpus: Vec<_> = mask.iter_cpu().map(|c| c.data()).collect();
        assert_eq!(cpus, vec![1, 3, 5]);
        assert_eq!(mask.count(), 3);
        assert!(mask.contains(ProcessorId::new(3)));
        assert!(!mask.contains(ProcessorId::new(2)));

        mask.set(ProcessorId::new(3), false);
        assert!(!mask.contains(ProcessorId::new(3)));
    }
}
