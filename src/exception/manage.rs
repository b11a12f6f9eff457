use alloc::sync::Arc;

use log::error;
use system_error::SystemError;

use crate::smp::cpu::ProcessorId;

use super::irqdesc::{
    irq_desc_manager, IrqHandleFlags, IrqHandler, IrqHandlerData,
};
use super::IrqNumber;

pub fn irq_manager() -> &'static IrqManager {
    &IrqManager
}

/// 中断管理器
///
/// 对外提供request/free等高层接口，把中断号分配、向量绑定和
/// 描述符内容的修改按正确的顺序（和回滚路径）串起来。
pub struct IrqManager;

impl IrqManager {
    /// 在中断线上安装一个处理函数
    ///
    /// ## 参数
    ///
    /// - `req`: 请求的中断号；为`IrqNumber::INVALID`时自动分配
    /// - `handler`: 中断处理函数
    /// - `data`: 传给处理函数的私有数据
    /// - `flags`: 触发方式等标志
    ///
    /// ## 返回
    ///
    /// 成功时返回实际分配到的中断号
    pub fn request_irq(
        &self,
        req: IrqNumber,
        handler: &'static dyn IrqHandler,
        data: Option<Arc<dyn IrqHandlerData>>,
        flags: IrqHandleFlags,
    ) -> Result<IrqNumber, SystemError> {
        let manager = irq_desc_manager();
        let irq = manager.alloc_irq_num(req, false)?;

        // 向量绑定失败时回滚中断号
        let vector = manager.alloc_irq_vector(irq);
        if let Err(e) = vector {
            error!("request_irq: no vector available for irq {}", irq.data());
            manager.free_irq_num(irq);
            return Err(e);
        }

        let desc = manager.lookup(irq).ok_or(SystemError::EINVAL)?;
        let mut desc_inner = desc.inner();
        if desc_inner.handler().is_some() {
            // 该中断线已被占用。不回滚：号和向量属于现有的持有者
            return Err(SystemError::EBUSY);
        }
        desc_inner.set_handler(Some(handler), data);
        *desc_inner.flags_mut() = flags;
        return Ok(irq);
    }

    /// 卸载中断处理函数，释放向量和（非保留的）中断号
    pub fn free_irq(&self, irq: IrqNumber) -> Result<(), SystemError> {
        let manager = irq_desc_manager();
        let desc = manager.lookup(irq).ok_or(SystemError::EINVAL)?;

        let mut desc_inner = desc.inner();
        if desc_inner.handler().is_none() {
            return Err(SystemError::EINVAL);
        }
        desc_inner.set_handler(None, None);
        *desc_inner.flags_mut() = IrqHandleFlags::empty();
        drop(desc_inner);

        manager.free_irq_vector(irq);
        manager.free_irq_num(irq);
        return Ok(());
    }

    /// 保留一个中断号（不会再被动态分配，也不会被释放）
    pub fn reserve_irq_num(&self, irq: IrqNumber) -> Result<IrqNumber, SystemError> {
        return irq_desc_manager().reserve_irq_num(irq);
    }

    /// 设置中断的触发方式
    pub fn set_irq_trigger_mode(&self, irq: IrqNumber, is_level: bool) -> Result<(), SystemError> {
        let desc = irq_desc_manager().lookup(irq).ok_or(SystemError::EINVAL)?;
        let mut desc_inner = desc.inner();
        if is_level {
            desc_inner.flags_mut().insert(IrqHandleFlags::IRQF_TRIGGER_LEVEL);
        } else {
            desc_inner.flags_mut().remove(IrqHandleFlags::IRQF_TRIGGER_LEVEL);
        }
        return Ok(());
    }

    /// 当前CPU的中断初始化：打开local APIC，BSP额外负责描述符表
    pub fn init_interrupt(&self, cpu_id: ProcessorId) -> Result<(), SystemError> {
        use crate::arch::driver::apic::LocalAPIC;
        crate::arch::CurrentApic.init_current_cpu();
        if cpu_id == ProcessorId::new(0) {
            // 描述符表和静态映射已经在early_irq_init中建立
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exception::irqdesc::{ensure_irq_init_for_test, IrqReturn};

    #[derive(Debug)]
    struct NopHandler;

    impl IrqHandler for NopHandler {
        fn handle(
            &self,
            _irq: IrqNumber,
            _dynamic_data: Option<Arc<dyn IrqHandlerData>>,
        ) -> Result<IrqReturn, SystemError> {
            Ok(IrqReturn::Handled)
        }
    }

    #[derive(Debug)]
    struct OtherHandler;

    impl IrqHandler for OtherHandler {
        fn handle(
            &self,
            _irq: IrqNumber,
            _dynamic_data: Option<Arc<dyn IrqHandlerData>>,
        ) -> Result<IrqReturn, SystemError> {
            Ok(IrqReturn::Handled)
        }
    }

    #[test]
    fn test_request_free_request_cycle() {
        ensure_irq_init_for_test();
        // S4：request -> free -> request，描述符内容随之更替。
        // 用一个其他测试不会扫到的中断号，避免并行测试抢占
        let irq = irq_manager()
            .request_irq(
                IrqNumber::new(42),
                &NopHandler,
                None,
                IrqHandleFlags::IRQF_TRIGGER_LEVEL,
            )
            .unwrap();
        {
            let desc = irq_desc_manager().lookup(irq).unwrap();
            let (handler, _, flags) = desc.action();
            assert!(handler.is_some());
            assert!(flags.contains(IrqHandleFlags::IRQF_TRIGGER_LEVEL));
        }

        irq_manager().free_irq(irq).unwrap();
        {
            let desc = irq_desc_manager().lookup(irq).unwrap();
            assert!(desc.action().0.is_none());
            assert_eq!(desc.vector(), crate::exception::HardwareIrqNumber::INVALID);
        }

        let irq2 = irq_manager()
            .request_irq(irq, &OtherHandler, None, IrqHandleFlags::empty())
            .unwrap();
        assert_eq!(irq2, irq);
        let desc = irq_desc_manager().lookup(irq2).unwrap();
        let (handler, _, flags) = desc.action();
        assert!(handler.is_some());
        assert!(flags.is_empty());
        irq_manager().free_irq(irq2).unwrap();
    }

    #[test]
    fn test_request_busy() {
        ensure_irq_init_for_test();
        let irq = irq_manager()
            .request_irq(IrqNumber::INVALID, &NopHandler, None, IrqHandleFlags::empty())
            .unwrap();
        // 同一根线再装一个处理函数被拒绝
        let err = irq_manager().request_irq(irq, &OtherHandler, None, IrqHandleFlags::empty());
        assert_eq!(err, Err(SystemError::EBUSY));
        // EBUSY不应破坏现有绑定
        assert!(irq_desc_manager().lookup(irq).unwrap().action().0.is_some());
        irq_manager().free_irq(irq).unwrap();
    }

    #[test]
    fn test_trigger_mode_toggle() {
        ensure_irq_init_for_test();
        let irq = irq_manager()
            .request_irq(IrqNumber::INVALID, &NopHandler, None, IrqHandleFlags::empty())
            .unwrap();
        irq_manager().set_irq_trigger_mode(irq, true).unwrap();
        assert!(irq_desc_manager()
            .lookup(irq)
            .unwrap()
            .action()
            .2
            .contains(IrqHandleFlags::IRQF_TRIGGER_LEVEL));
        irq_manager().set_irq_trigger_mode(irq, false).unwrap();
        assert!(!irq_desc_manager()
            .lookup(irq)
            .unwrap()
            .action()
            .2
            .contains(IrqHandleFlags::IRQF_TRIGGER_LEVEL));
        irq_manager().free_irq(irq).unwrap();
    }
}
