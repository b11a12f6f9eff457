//! 中断分发
//!
//! 架构的中断入口把向量号交给[`dispatch_interrupt`]；这里完成
//! 向量到中断号的映射、spurious处理、前后钩子和softirq收尾。

use log::warn;

use crate::arch::driver::apic::LocalAPIC;
use crate::arch::CurrentApic;
use crate::smp::cpu::ProcessorId;

use super::irqdesc::{irq_desc_manager, irq_stats, IrqHandleFlags, IrqReturn};
use super::softirq::do_softirq;
use super::{HardwareIrqNumber, InterruptArch, IrqNumber};

/// spurious中断的可选回调
static mut SPURIOUS_HANDLER: Option<fn(HardwareIrqNumber)> = None;

/// 注册spurious中断回调。只应在启动期调用
pub fn set_spurious_handler(handler: fn(HardwareIrqNumber)) {
    unsafe {
        SPURIOUS_HANDLER = Some(handler);
    }
}

/// 中断分发入口。`vector`来自架构的中断入口代码
pub fn dispatch_interrupt(vector: HardwareIrqNumber) {
    let irq = irq_desc_manager().vector_to_irq(vector);
    if irq == IrqNumber::INVALID {
        handle_spurious_irq(vector);
        return;
    }

    do_irq(irq);

    // 返回前清掉本CPU积压的softirq
    do_softirq();
}

/// 处理一个已映射的中断
pub fn do_irq(irq: IrqNumber) {
    let desc = match irq_desc_manager().lookup(irq) {
        Some(d) => d,
        None => {
            warn!("do_irq: no descriptor for irq {}", irq.data());
            return;
        }
    };

    let (handler, data, flags) = desc.action();

    pre_irq(irq, flags);

    if let Some(handler) = handler {
        match handler.handle(irq, data) {
            Ok(IrqReturn::Handled) | Ok(IrqReturn::NotHandled) => {}
            Err(e) => {
                warn!("irq {} handler failed: {:?}", irq.data(), e);
            }
        }
    } else {
        warn!("do_irq: irq {} has no action installed", irq.data());
    }

    irq_stats().get_mut().inc(irq);

    post_irq(irq, flags);
}

/// 中断处理前：电平触发的非直通引脚先mask，然后发EOI
fn pre_irq(irq: IrqNumber, flags: IrqHandleFlags) {
    if flags.contains(IrqHandleFlags::IRQF_TRIGGER_LEVEL)
        && !flags.contains(IrqHandleFlags::IRQF_PT)
    {
        crate::arch::interrupt::ioapic_mask_pin(irq);
    }
    CurrentApic.send_eoi();
}

/// 中断处理后：恢复被mask的电平触发引脚
fn post_irq(irq: IrqNumber, flags: IrqHandleFlags) {
    if flags.contains(IrqHandleFlags::IRQF_TRIGGER_LEVEL)
        && !flags.contains(IrqHandleFlags::IRQF_PT)
    {
        crate::arch::interrupt::ioapic_unmask_pin(irq);
    }
}

/// 未分配向量上的中断：计数、回调、EOI
fn handle_spurious_irq(vector: HardwareIrqNumber) {
    irq_stats().get_mut().inc_spurious();
    if let Some(handler) = unsafe { SPURIOUS_HANDLER } {
        handler(vector);
    }
    crate::arch::CurrentIrqArch::ack_bad_irq(vector);
}

/// 供挂起路径查询某个cpu的中断次数
pub fn irq_count_on(cpu: ProcessorId, irq: IrqNumber) -> u64 {
    return irq_stats().force_get(cpu).count(irq);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::irqdesc::{
        ensure_irq_init_for_test, IrqHandler, IrqHandlerData, IrqReturn,
    };
    use crate::exception::manage::irq_manager;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};
    use system_error::SystemError;

    static FIRED: AtomicU32 = AtomicU32::new(0);

    #[derive(Debug)]
    struct CountingHandler;

    impl IrqHandler for CountingHandler {
        fn handle(
            &self,
            _irq: IrqNumber,
            _dynamic_data: Option<Arc<dyn IrqHandlerData>>,
        ) -> Result<IrqReturn, SystemError> {
            FIRED.fetch_add(1, Ordering::SeqCst);
            Ok(IrqReturn::Handled)
        }
    }

    #[test]
    fn test_dispatch_invokes_action() {
        ensure_irq_init_for_test();
        let irq = irq_manager()
            .request_irq(
                IrqNumber::INVALID,
                &CountingHandler,
                None,
                IrqHandleFlags::empty(),
            )
            .unwrap();
        let vector = irq_desc_manager().lookup(irq).unwrap().vector();

        let before = FIRED.load(Ordering::SeqCst);
        let count_before = irq_stats().get().count(irq);
        dispatch_interrupt(vector);
        assert_eq!(FIRED.load(Ordering::SeqCst), before + 1);
        assert_eq!(irq_stats().get().count(irq), count_before + 1);
        irq_manager().free_irq(irq).unwrap();
    }

    #[test]
    fn test_spurious_counted() {
        ensure_irq_init_for_test();
        let before = irq_stats().get().spurious_count();
        // 动态区间从低处向高处分配，0xDD不会被测试进程用到，
        // 用它模拟一个落在未绑定向量上的spurious中断
        dispatch_interrupt(HardwareIrqNumber::new(0xDD));
        let after = irq_stats().get().spurious_count();
        assert!(after >= before + 1);
    }
}
