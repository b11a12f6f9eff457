use ::core::hint::spin_loop;
use ::core::sync::atomic::{AtomicU64, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;

use log::warn;
use system_error::SystemError;

use crate::arch::interrupt::{ipi as arch_ipi, NOTIFY_VCPU_IRQ, POSTED_INTR_IRQ_BASE};
use crate::config::MAX_VM_NUM;
use crate::exception::ipi::{send_ipi, IpiKind, IpiTarget};
use crate::exception::irqdesc::{IrqHandleFlags, IrqHandler, IrqHandlerData, IrqReturn};
use crate::exception::manage::irq_manager;
use crate::exception::IrqNumber;
use crate::libs::spinlock::SpinLock;
use crate::mm::percpu::{PerCpu, PerCpuVar};
use crate::smp::core::smp_get_processor_id;
use crate::smp::cpu::{smp_cpu_manager, ProcessorId};
use crate::virt::vm::{governing_vcpu, signal_posted_intr, VcpuRequest};

pub mod core;
pub mod cpu;

/// SMP call的回调类型
pub type SmpCallFn = fn(data: usize);

#[derive(Debug, Default)]
struct SmpCallInfo {
    func: Option<SmpCallFn>,
    data: usize,
}

/// 当前待应答的跨核调用目标集合
///
/// 发起者用CAS把它从0换成目标位集（同一时刻只有一轮调用），
/// 每个目标执行完回调后原子清掉自己的位。清位的Release语义
/// 就是"回调已完成"的发布。
static SMP_CALL_MASK: AtomicU64 = AtomicU64::new(0);

static mut SMP_CALL_INFO: Option<PerCpuVar<SpinLock<SmpCallInfo>>> = None;

#[inline(always)]
fn smp_call_info() -> &'static PerCpuVar<SpinLock<SmpCallInfo>> {
    unsafe { SMP_CALL_INFO.as_ref().unwrap() }
}

/// 初始化SMP call的每CPU槽位。只应在BSP早期调用一次
pub fn smp_init() -> Result<(), SystemError> {
    let mut info = Vec::with_capacity(PerCpu::MAX_CPU_NUM as usize);
    for _ in 0..PerCpu::MAX_CPU_NUM {
        info.push(SpinLock::new(SmpCallInfo::default()));
    }
    unsafe {
        SMP_CALL_INFO = Some(PerCpuVar::new(info).ok_or(SystemError::ENOMEM)?);
    }
    return Ok(());
}

/// 在`mask`指定的每个pCPU上执行一次`func(data)`
///
/// 返回时保证：每个位都已从[`SMP_CALL_MASK`]中清除，即每个
/// 在线目标都执行完了回调。离线的目标由发起者直接清位并告警。
/// 不支持取消和超时：目标不应答就一直等。
pub fn smp_call_function(mask: u64, func: SmpCallFn, data: usize) -> Result<(), SystemError> {
    if mask == 0 {
        return Err(SystemError::EINVAL);
    }

    // 等待上一轮调用排空，然后独占通道
    while SMP_CALL_MASK
        .compare_exchange(0, mask, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        spin_loop();
    }

    let me = smp_get_processor_id();
    let mut remaining = mask;
    while remaining != 0 {
        let cpu_index = remaining.trailing_zeros();
        remaining &= remaining - 1;
        let cpu = ProcessorId::new(cpu_index);

        if cpu == me {
            // 自己的份额就地执行
            func(data);
            SMP_CALL_MASK.fetch_and(!(1u64 << cpu_index), Ordering::Release);
        } else if smp_cpu_manager().is_online(cpu) {
            {
                // 槽位锁的释放保证写入先于目标的读取
                let mut slot = smp_call_info().force_get(cpu).lock_irqsave();
                slot.func = Some(func);
                slot.data = data;
            }
            kick_target(cpu);
        } else {
            warn!("smp_call: target cpu {} is offline, skip", cpu_index);
            SMP_CALL_MASK.fetch_and(!(1u64 << cpu_index), Ordering::Release);
        }
    }

    // 所有目标清位后才返回
    while SMP_CALL_MASK.load(Ordering::Acquire) != 0 {
        spin_loop();
    }
    return Ok(());
}

/// 目标侧的处理：执行自己的槽位并清位
///
/// 中断路径和（LAPIC直通目标的）VM-exit路径都走这里，语义相同。
pub fn handle_smp_call() {
    let me = smp_get_processor_id();
    if me.data() >= 64 {
        return;
    }
    let bit = 1u64 << me.data();
    if SMP_CALL_MASK.load(Ordering::Acquire) & bit != 0 {
        // 取走槽位里的回调。槽位还没写好时什么都不做，
        // 等发起者的通知再来一次
        let (func, data) = {
            let mut slot = smp_call_info().get().lock_irqsave();
            (slot.func.take(), slot.data)
        };
        if let Some(func) = func {
            func(data);
            // 清位即发布"回调已完成"
            SMP_CALL_MASK.fetch_and(!bit, Ordering::Release);
        }
    }
}

/// 通知目标CPU处理跨核调用
///
/// 目标上运行着LAPIC直通的vCPU时，notify向量被guest屏蔽，
/// 只能挂一个请求再用INIT强制它VM-exit；其余情况发普通IPI。
fn kick_target(cpu: ProcessorId) {
    if let Some(vcpu) = governing_vcpu(cpu) {
        if vcpu.has_lapic_pt() && vcpu.is_running() {
            vcpu.make_request(VcpuRequest::SMP_CALL);
            arch_ipi::send_init_ipi(cpu);
            return;
        }
    }
    send_ipi(IpiKind::SmpCall, IpiTarget::Specified(cpu));
}

/// notify向量的中断处理函数
#[derive(Debug)]
struct NotifyIrqHandler;

impl IrqHandler for NotifyIrqHandler {
    fn handle(
        &self,
        _irq: IrqNumber,
        _dynamic_data: Option<Arc<dyn IrqHandlerData>>,
    ) -> Result<IrqReturn, SystemError> {
        handle_smp_call();
        return Ok(IrqReturn::Handled);
    }
}

/// posted-interrupt通知的中断处理函数
///
/// VM槽位索引由中断号减去基值得出，每个pCPU上一个VM至多
/// 运行一个vCPU，因此一个VM一个向量就够了。
#[derive(Debug)]
struct PostedIntrHandler;

impl IrqHandler for PostedIntrHandler {
    fn handle(
        &self,
        irq: IrqNumber,
        _dynamic_data: Option<Arc<dyn IrqHandlerData>>,
    ) -> Result<IrqReturn, SystemError> {
        let vm_id = irq.data() - POSTED_INTR_IRQ_BASE.data();
        signal_posted_intr(vm_id);
        return Ok(IrqReturn::Handled);
    }
}

/// 注册SMP call的notify中断。每个系统一次
pub fn setup_notification() -> Result<(), SystemError> {
    irq_manager()
        .request_irq(
            NOTIFY_VCPU_IRQ,
            &NotifyIrqHandler,
            None,
            IrqHandleFlags::empty(),
        )
        .map(|_| ())
}

/// 注销notify中断（pCPU下线路径）
pub fn cleanup_notification() {
    irq_manager().free_irq(NOTIFY_VCPU_IRQ).ok();
}

/// 为每个VM槽位注册posted-interrupt通知中断
pub fn setup_pi_notification() -> Result<(), SystemError> {
    for vm in 0..MAX_VM_NUM as u32 {
        irq_manager().request_irq(
            POSTED_INTR_IRQ_BASE + vm,
            &PostedIntrHandler,
            None,
            IrqHandleFlags::empty(),
        )?;
    }
    return Ok(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::core::sync::atomic::AtomicU64 as StdAtomicU64;
    use std::sync::atomic::{AtomicBool, Ordering as StdOrdering};
    use std::sync::Arc as StdArc;
    use std::thread;

    fn ensure_init() {
        use std::sync::Once;
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            crate::smp::cpu::smp_cpu_manager_init();
            smp_init().unwrap();
            crate::virt::vm::virt_init_for_test();
        });
    }

    static EXECUTED_ON: StdAtomicU64 = StdAtomicU64::new(0);

    fn record_cpu(_data: usize) {
        let me = smp_get_processor_id().data();
        EXECUTED_ON.fetch_or(1 << me, Ordering::SeqCst);
    }

    #[test]
    fn test_smp_call_self_only() {
        ensure_init();
        crate::smp::core::tests::set_test_processor_id(ProcessorId::new(0));
        EXECUTED_ON.fetch_and(!1, Ordering::SeqCst);
        smp_call_function(1 << 0, record_cpu, 0).unwrap();
        assert_ne!(EXECUTED_ON.load(Ordering::SeqCst) & 1, 0);
        assert_eq!(SMP_CALL_MASK.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_smp_call_offline_targets_skipped() {
        ensure_init();
        crate::smp::core::tests::set_test_processor_id(ProcessorId::new(0));
        // cpu 9 没有上线：发起者直接清位，不会挂死
        smp_call_function(1 << 9, record_cpu, 0).unwrap();
        assert_eq!(SMP_CALL_MASK.load(Ordering::SeqCst), 0);
        assert_eq!(EXECUTED_ON.load(Ordering::SeqCst) & (1 << 9), 0);
    }

    #[test]
    fn test_smp_call_multi_target() {
        ensure_init();
        // S5：pCPU 1/3/5在线，各执行一次，mask最终清零
        let stop = StdArc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for cpu in [1u32, 3, 5] {
            smp_cpu_manager().set_online(ProcessorId::new(cpu), true);
            let stop = stop.clone();
            handles.push(thread::spawn(move || {
                crate::smp::core::tests::set_test_processor_id(ProcessorId::new(cpu));
                while !stop.load(StdOrdering::SeqCst) {
                    handle_smp_call();
                    std::hint::spin_loop();
                }
            }));
        }

        crate::smp::core::tests::set_test_processor_id(ProcessorId::new(0));
        EXECUTED_ON.store(0, Ordering::SeqCst);
        let mask = (1 << 1) | (1 << 3) | (1 << 5);
        smp_call_function(mask, record_cpu, 0xABCD).unwrap();

        assert_eq!(SMP_CALL_MASK.load(Ordering::SeqCst), 0);
        assert_eq!(EXECUTED_ON.load(Ordering::SeqCst), mask);

        stop.store(true, StdOrdering::SeqCst);
        for h in handles {
            h.join().unwrap();
        }
        for cpu in [1u32, 3, 5] {
            smp_cpu_manager().set_online(ProcessorId::new(cpu), false);
        }
    }
}
