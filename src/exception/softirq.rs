use core::fmt::Debug;
use core::sync::atomic::{AtomicU64, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;

use system_error::SystemError;

use crate::libs::spinlock::SpinLock;
use crate::mm::percpu::{PerCpu, PerCpuVar};

const MAX_SOFTIRQ_NUM: u32 = 64;

int_like!(SoftirqNumber, u32);

/// 软中断处理向量
pub trait SoftirqVec: Send + Sync + Debug {
    fn run(&self);
}

/// 软中断子系统
///
/// 硬中断处理返回前，dispatch路径会排空当前CPU积压的软中断。
/// pending位是每CPU的，注册表是全局的。
pub struct Softirq {
    table: SpinLock<[Option<Arc<dyn SoftirqVec>>; MAX_SOFTIRQ_NUM as usize]>,
    cpu_pending: PerCpuVar<AtomicU64>,
}

static mut SOFTIRQ_VECTORS: Option<Softirq> = None;

#[inline(always)]
pub fn softirq_vectors() -> &'static Softirq {
    unsafe { SOFTIRQ_VECTORS.as_ref().unwrap() }
}

/// 初始化软中断子系统。只应在BSP早期调用一次
#[inline(never)]
pub fn softirq_init() -> Result<(), SystemError> {
    let mut pending = Vec::with_capacity(PerCpu::MAX_CPU_NUM as usize);
    for _ in 0..PerCpu::MAX_CPU_NUM {
        pending.push(AtomicU64::new(0));
    }

    unsafe {
        SOFTIRQ_VECTORS = Some(Softirq {
            table: SpinLock::new([const { None }; MAX_SOFTIRQ_NUM as usize]),
            cpu_pending: PerCpuVar::new(pending).unwrap(),
        });
    }
    return Ok(());
}

impl Softirq {
    /// 注册软中断向量
    pub fn register_softirq(
        &self,
        num: SoftirqNumber,
        handler: Arc<dyn SoftirqVec>,
    ) -> Result<(), SystemError> {
        if num.data() >= MAX_SOFTIRQ_NUM {
            return Err(SystemError::EINVAL);
        }
        let mut table = self.table.lock_irqsave();
        if table[num.data() as usize].is_some() {
            return Err(SystemError::EEXIST);
        }
        table[num.data() as usize] = Some(handler);
        return Ok(());
    }

    /// 注销软中断向量
    pub fn unregister_softirq(&self, num: SoftirqNumber) {
        if num.data() >= MAX_SOFTIRQ_NUM {
            return;
        }
        let mut table = self.table.lock_irqsave();
        table[num.data() as usize] = None;
        self.cpu_pending
            .get()
            .fetch_and(!(1u64 << num.data()), Ordering::Release);
    }

    /// 在当前CPU上标记一个待处理的软中断
    pub fn raise_softirq(&self, num: SoftirqNumber) {
        if num.data() >= MAX_SOFTIRQ_NUM {
            return;
        }
        self.cpu_pending
            .get()
            .fetch_or(1u64 << num.data(), Ordering::Release);
    }

    pub fn clear_softirq_pending(&self, num: SoftirqNumber) {
        self.cpu_pending
            .get()
            .fetch_and(!(1u64 << num.data()), Ordering::Release);
    }

    fn do_softirq(&self) {
        // 一次取走全部pending位，处理期间新到的留到下一轮
        let mut pending = self.cpu_pending.get().swap(0, Ordering::AcqRel);
        while pending != 0 {
            let num = pending.trailing_zeros();
            pending &= !(1u64 << num);

            let handler = {
                let table = self.table.lock_irqsave();
                table[num as usize].clone()
            };
            if let Some(handler) = handler {
                handler.run();
            }
        }
    }
}

/// 排空当前CPU的软中断
pub fn do_softirq() {
    if unsafe { SOFTIRQ_VECTORS.as_ref() }.is_some() {
        softirq_vectors().do_softirq();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    static RUNS: AtomicU32 = AtomicU32::new(0);

    #[derive(Debug)]
    struct TestSoftirq;

    impl SoftirqVec for TestSoftirq {
        fn run(&self) {
            RUNS.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ensure_init() {
        use std::sync::Once;
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            softirq_init().unwrap();
        });
    }

    #[test]
    fn test_raise_and_drain() {
        ensure_init();
        let num = SoftirqNumber::new(7);
        softirq_vectors()
            .register_softirq(num, Arc::new(TestSoftirq))
            .unwrap();

        let before = RUNS.load(Ordering::SeqCst);
        softirq_vectors().raise_softirq(num);
        softirq_vectors().raise_softirq(num);
        do_softirq();
        // 同一个pending位只执行一次
        assert_eq!(RUNS.load(Ordering::SeqCst), before + 1);

        do_softirq();
        assert_eq!(RUNS.load(Ordering::SeqCst), before + 1);

        softirq_vectors().unregister_softirq(num);
        let err = softirq_vectors().register_softirq(
            SoftirqNumber::new(MAX_SOFTIRQ_NUM),
            Arc::new(TestSoftirq),
        );
        assert_eq!(err, Err(SystemError::EINVAL));
    }
}
