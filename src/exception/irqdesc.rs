use core::any::Any;
use core::fmt::Debug;

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitmap::{traits::BitMapOps, AllocBitmap};
use system_error::SystemError;

use crate::arch::interrupt::{
    irq_static_mappings, NR_IRQS, VECTOR_DYNAMIC_END, VECTOR_DYNAMIC_START,
};
use crate::arch::CurrentIrqArch;
use crate::libs::spinlock::{SpinLock, SpinLockGuard};
use crate::mm::percpu::{PerCpu, PerCpuVar};

use super::{HardwareIrqNumber, InterruptArch, IrqNumber};

/// 中断处理函数携带的私有数据
pub trait IrqHandlerData: Debug + Send + Sync + Any {}

/// 中断处理程序
pub trait IrqHandler: Debug + Send + Sync {
    fn handle(
        &self,
        irq: IrqNumber,
        dynamic_data: Option<Arc<dyn IrqHandlerData>>,
    ) -> Result<IrqReturn, SystemError>;
}

/// 中断处理函数返回值
///
/// 用于指示中断处理函数是否处理了中断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// 中断未被处理
    NotHandled,
    /// 中断已被处理
    Handled,
}

bitflags! {
    /// 中断处理标志
    pub struct IrqHandleFlags: u32 {
        /// 电平触发（默认为边沿触发）
        const IRQF_TRIGGER_LEVEL = 1 << 0;
        /// 引脚直通给guest，dispatch路径不得mask/unmask它
        const IRQF_PT = 1 << 1;
    }
}

/// 每根中断线的描述符
///
/// 描述符自身的锁保护action和flags；中断号/向量的分配关系
/// 由[`IrqDescManager`]的全局锁保护。
#[derive(Debug)]
pub struct IrqDesc {
    inner: SpinLock<InnerIrqDesc>,
}

#[derive(Debug)]
pub struct InnerIrqDesc {
    irq: IrqNumber,
    /// 绑定的中断向量（arch数据）
    vector: HardwareIrqNumber,
    handler: Option<&'static dyn IrqHandler>,
    handler_data: Option<Arc<dyn IrqHandlerData>>,
    flags: IrqHandleFlags,
}

impl IrqDesc {
    fn new(irq: IrqNumber) -> Arc<Self> {
        return Arc::new(IrqDesc {
            inner: SpinLock::new(InnerIrqDesc {
                irq,
                vector: HardwareIrqNumber::INVALID,
                handler: None,
                handler_data: None,
                flags: IrqHandleFlags::empty(),
            }),
        });
    }

    pub fn inner(&self) -> SpinLockGuard<InnerIrqDesc> {
        self.inner.lock_irqsave()
    }

    pub fn irq(&self) -> IrqNumber {
        self.inner().irq
    }

    pub fn vector(&self) -> HardwareIrqNumber {
        self.inner().vector
    }

    /// 取出处理函数和标志，供dispatch路径使用
    #[allow(clippy::type_complexity)]
    pub fn action(
        &self,
    ) -> (
        Option<&'static dyn IrqHandler>,
        Option<Arc<dyn IrqHandlerData>>,
        IrqHandleFlags,
    ) {
        let inner = self.inner();
        return (inner.handler, inner.handler_data.clone(), inner.flags);
    }
}

impl InnerIrqDesc {
    pub fn irq(&self) -> IrqNumber {
        self.irq
    }

    pub fn vector(&self) -> HardwareIrqNumber {
        self.vector
    }

    pub(super) fn set_vector(&mut self, vector: HardwareIrqNumber) {
        self.vector = vector;
    }

    pub fn handler(&self) -> Option<&'static dyn IrqHandler> {
        self.handler
    }

    pub(super) fn set_handler(
        &mut self,
        handler: Option<&'static dyn IrqHandler>,
        data: Option<Arc<dyn IrqHandlerData>>,
    ) {
        self.handler = handler;
        self.handler_data = data;
    }

    pub fn flags(&self) -> IrqHandleFlags {
        self.flags
    }

    pub(super) fn flags_mut(&mut self) -> &mut IrqHandleFlags {
        &mut self.flags
    }
}

/// 每CPU的中断统计
#[derive(Debug)]
pub struct IrqStats {
    counts: Vec<u64>,
    spurious: u64,
}

impl IrqStats {
    fn new() -> Self {
        Self {
            counts: vec![0; NR_IRQS as usize],
            spurious: 0,
        }
    }

    pub fn count(&self, irq: IrqNumber) -> u64 {
        self.counts[irq.data() as usize]
    }

    pub fn spurious_count(&self) -> u64 {
        self.spurious
    }

    pub(super) fn inc(&mut self, irq: IrqNumber) {
        self.counts[irq.data() as usize] += 1;
    }

    pub(super) fn inc_spurious(&mut self) {
        self.spurious += 1;
    }
}

static mut IRQ_STATS: Option<PerCpuVar<IrqStats>> = None;

/// 当前CPU的中断统计
pub fn irq_stats() -> &'static PerCpuVar<IrqStats> {
    unsafe { IRQ_STATS.as_ref().unwrap() }
}

/// 中断描述符管理器
///
/// 固定持有NR_IRQS个描述符。分配位图、保留位图和向量反查表
/// 都在全局锁（IRQ-save）之下。
pub struct IrqDescManager {
    descs: Vec<Arc<IrqDesc>>,
    inner: SpinLock<InnerIrqDescManager>,
}

struct InnerIrqDescManager {
    /// 已分配的中断号
    irq_alloc_bitmap: AllocBitmap,
    /// 静态保留的中断号（irq_alloc_bitmap的子集，永不释放）
    irq_rsvd_bitmap: AllocBitmap,
    /// 向量 -> 中断号 反查表
    vector_to_irq: [IrqNumber; 257],
}

impl IrqDescManager {
    fn new() -> Self {
        let irqcnt = CurrentIrqArch::probe_total_irq_num() as usize;
        let mut descs = Vec::with_capacity(irqcnt);
        for i in 0..irqcnt {
            descs.push(IrqDesc::new(IrqNumber::new(i as u32)));
        }
        return IrqDescManager {
            descs,
            inner: SpinLock::new(InnerIrqDescManager {
                irq_alloc_bitmap: AllocBitmap::new(irqcnt),
                irq_rsvd_bitmap: AllocBitmap::new(irqcnt),
                vector_to_irq: [IrqNumber::INVALID; 257],
            }),
        };
    }

    /// 查找中断描述符
    pub fn lookup(&self, irq: IrqNumber) -> Option<&Arc<IrqDesc>> {
        self.descs.get(irq.data() as usize)
    }

    /// 分配一个中断号
    ///
    /// `req`为INVALID时从位图中找第一个空闲的中断号；否则在范围
    /// 内就直接使用`req`（重复分配同一个号是幂等的）。
    /// `reserve`置位时该号同时进入保留位图，永不归还。
    pub fn alloc_irq_num(
        &self,
        req: IrqNumber,
        reserve: bool,
    ) -> Result<IrqNumber, SystemError> {
        let mut inner = self.inner.lock_irqsave();
        let irq = if req == IrqNumber::INVALID {
            match inner.irq_alloc_bitmap.first_false_index() {
                Some(index) => IrqNumber::new(index as u32),
                None => return Err(SystemError::ENOSPC),
            }
        } else {
            if req.data() >= NR_IRQS {
                return Err(SystemError::EINVAL);
            }
            req
        };

        inner.irq_alloc_bitmap.set(irq.data() as usize, true);
        if reserve {
            inner.irq_rsvd_bitmap.set(irq.data() as usize, true);
        }
        return Ok(irq);
    }

    /// 保留一个中断号（alloc的reserve=true面）
    pub fn reserve_irq_num(&self, irq: IrqNumber) -> Result<IrqNumber, SystemError> {
        return self.alloc_irq_num(irq, true);
    }

    /// 释放一个中断号。保留的号在系统生命期内不释放
    pub fn free_irq_num(&self, irq: IrqNumber) {
        if irq.data() >= NR_IRQS {
            return;
        }
        let mut inner = self.inner.lock_irqsave();
        if inner.irq_rsvd_bitmap.get(irq.data() as usize) != Some(true) {
            inner.irq_alloc_bitmap.set(irq.data() as usize, false);
        }
    }

    /// 为中断号分配一个向量
    ///
    /// 幂等：描述符已经持有向量且反查表一致时直接返回原向量。
    /// 否则在动态区间`[0x20, 0xDF]`里找第一个空位并双向绑定。
    pub fn alloc_irq_vector(&self, irq: IrqNumber) -> Result<HardwareIrqNumber, SystemError> {
        let desc = self.lookup(irq).ok_or(SystemError::EINVAL)?;
        let mut inner = self.inner.lock_irqsave();
        let mut desc_inner = desc.inner();

        let bound = desc_inner.vector();
        if bound != HardwareIrqNumber::INVALID
            && inner.vector_to_irq[bound.data() as usize] == irq
        {
            return Ok(bound);
        }

        for v in VECTOR_DYNAMIC_START.data()..=VECTOR_DYNAMIC_END.data() {
            if inner.vector_to_irq[v as usize] == IrqNumber::INVALID {
                inner.vector_to_irq[v as usize] = irq;
                let vector = HardwareIrqNumber::new(v);
                desc_inner.set_vector(vector);
                return Ok(vector);
            }
        }
        return Err(SystemError::ENOSPC);
    }

    /// 解绑中断号的向量。静态绑定（固定区间）的向量不动
    pub fn free_irq_vector(&self, irq: IrqNumber) {
        let desc = match self.lookup(irq) {
            Some(d) => d,
            None => return,
        };
        let mut inner = self.inner.lock_irqsave();
        let mut desc_inner = desc.inner();
        let vector = desc_inner.vector();

        // 只有动态分配的向量才回池
        if vector < VECTOR_DYNAMIC_START || vector > VECTOR_DYNAMIC_END {
            return;
        }
        if inner.vector_to_irq[vector.data() as usize] == irq {
            inner.vector_to_irq[vector.data() as usize] = IrqNumber::INVALID;
        }
        desc_inner.set_vector(HardwareIrqNumber::INVALID);
    }

    /// 向量反查中断号
    pub fn vector_to_irq(&self, vector: HardwareIrqNumber) -> IrqNumber {
        if vector.data() > 0x100 {
            return IrqNumber::INVALID;
        }
        let inner = self.inner.lock_irqsave();
        return inner.vector_to_irq[vector.data() as usize];
    }

    /// 安装启动期的静态IRQ<->向量映射
    fn setup_static_mappings(&self) {
        for (irq, vector) in irq_static_mappings() {
            self.reserve_irq_num(irq).expect("static irq out of range");
            let mut inner = self.inner.lock_irqsave();
            inner.vector_to_irq[vector.data() as usize] = irq;
            drop(inner);
            self.lookup(irq).unwrap().inner().set_vector(vector);
        }
    }
}

static mut IRQ_DESC_MANAGER: Option<IrqDescManager> = None;

/// 获取中断描述符管理器的引用
#[inline(always)]
pub fn irq_desc_manager() -> &'static IrqDescManager {
    return unsafe { IRQ_DESC_MANAGER.as_ref().unwrap() };
}

/// 初始化中断描述符表和静态映射。只应在BSP早期调用一次
#[inline(never)]
pub fn early_irq_init() -> Result<(), SystemError> {
    let manager = IrqDescManager::new();
    manager.setup_static_mappings();

    let mut stats = Vec::with_capacity(PerCpu::MAX_CPU_NUM as usize);
    for _ in 0..PerCpu::MAX_CPU_NUM {
        stats.push(IrqStats::new());
    }

    unsafe {
        IRQ_DESC_MANAGER = Some(manager);
        IRQ_STATS = Some(PerCpuVar::new(stats).unwrap());
    }

    return CurrentIrqArch::arch_early_irq_init();
}

/// 测试环境下按需完成一次初始化
#[cfg(test)]
pub fn ensure_irq_init_for_test() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        early_irq_init().unwrap();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::interrupt::{
        CMCI_IRQ, NOTIFY_VCPU_IRQ, POSTED_INTR_IRQ_BASE, POSTED_INTR_VECTOR_BASE, TIMER_IRQ,
        VECTOR_NOTIFY_VCPU, VECTOR_TIMER,
    };

    #[test]
    fn test_static_mappings_installed() {
        ensure_irq_init_for_test();
        let manager = irq_desc_manager();
        assert_eq!(manager.vector_to_irq(VECTOR_TIMER), TIMER_IRQ);
        assert_eq!(manager.vector_to_irq(VECTOR_NOTIFY_VCPU), NOTIFY_VCPU_IRQ);
        assert_eq!(manager.lookup(TIMER_IRQ).unwrap().vector(), VECTOR_TIMER);
        // posted-interrupt槽位逐个递增
        for i in 0..crate::config::MAX_VM_NUM as u32 {
            let irq = POSTED_INTR_IRQ_BASE + i;
            assert_eq!(
                manager.lookup(irq).unwrap().vector(),
                POSTED_INTR_VECTOR_BASE + i
            );
        }
    }

    #[test]
    fn test_vector_alloc_idempotent() {
        ensure_irq_init_for_test();
        let manager = irq_desc_manager();
        // S3：同一个irq两次分配得到同一个向量
        let irq = IrqNumber::new(10);
        manager.alloc_irq_num(irq, false).unwrap();
        let v1 = manager.alloc_irq_vector(irq).unwrap();
        let v2 = manager.alloc_irq_vector(irq).unwrap();
        assert_eq!(v1, v2);
        assert!(v1 >= VECTOR_DYNAMIC_START && v1 <= VECTOR_DYNAMIC_END);
        assert_eq!(manager.vector_to_irq(v1), irq);
    }

    #[test]
    fn test_reserved_irq_survives_free() {
        ensure_irq_init_for_test();
        let manager = irq_desc_manager();
        // 静态保留的号释放后仍然是已分配状态
        manager.free_irq_num(CMCI_IRQ);
        let irq = manager.alloc_irq_num(IrqNumber::INVALID, false).unwrap();
        assert_ne!(irq, CMCI_IRQ);
        manager.free_irq_num(irq);
    }

    #[test]
    fn test_dynamic_vector_never_in_fixed_range() {
        ensure_irq_init_for_test();
        let manager = irq_desc_manager();
        let irq = manager.alloc_irq_num(IrqNumber::INVALID, false).unwrap();
        let vector = manager.alloc_irq_vector(irq).unwrap();
        assert!(vector.data() < 0xE0, "vector {:x}", vector.data());
        manager.free_irq_vector(irq);
        manager.free_irq_num(irq);
    }
}
