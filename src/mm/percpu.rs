use alloc::vec::Vec;

use crate::smp::core::smp_get_processor_id;
use crate::smp::cpu::ProcessorId;

/// 每个CPU的私有信息
#[derive(Debug)]
pub struct PerCpu;

impl PerCpu {
    pub const MAX_CPU_NUM: u32 = 64;
}

/// 每个CPU的私有变量
///
/// 每个CPU只会访问自己的那一份数据，因此`get_mut`不需要加锁。
/// 跨CPU访问必须使用`force_get`系列，并由调用方保证所有权
/// （例如smp call的槽位在目标CPU应答前归发起者所有）。
#[derive(Debug)]
pub struct PerCpuVar<T> {
    inner: Vec<T>,
}

#[allow(dead_code)]
impl<T> PerCpuVar<T> {
    /// 创建一个新的PerCpuVar。`data`的长度必须等于CPU的最大数量
    pub fn new(data: Vec<T>) -> Option<Self> {
        if data.len() != PerCpu::MAX_CPU_NUM as usize {
            return None;
        }
        return Some(Self { inner: data });
    }

    pub fn get(&self) -> &T {
        &self.inner[smp_get_processor_id().data() as usize]
    }

    #[allow(clippy::mut_from_ref)]
    pub fn get_mut(&self) -> &mut T {
        let cpu = smp_get_processor_id().data() as usize;
        unsafe { &mut *(self.inner.as_ptr().add(cpu) as *mut T) }
    }

    /// 获取指定CPU的数据
    pub fn force_get(&self, cpu: ProcessorId) -> &T {
        &self.inner[cpu.data() as usize]
    }

    /// 获取指定CPU的数据的可变引用
    ///
    /// ## Safety
    ///
    /// 调用者必须保证此时拥有目标CPU这份数据的所有权
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn force_get_mut(&self, cpu: ProcessorId) -> &mut T {
        &mut *(self.inner.as_ptr().add(cpu.data() as usize) as *mut T)
    }
}

unsafe impl<T> Sync for PerCpuVar<T> {}
unsafe impl<T> Send for PerCpuVar<T> {}
