use crate::libs::cpumask::CpuMask;
use crate::libs::spinlock::SpinLock;
use crate::mm::percpu::PerCpu;

int_like!(ProcessorId, AtomicProcessorId, u32, AtomicU32);

impl ProcessorId {
    pub const INVALID: ProcessorId = ProcessorId::new(u32::MAX);
}

/// CPU管理器：记录possible/online集合
pub struct SmpCpuManager {
    possible_cpus: SpinLock<CpuMask>,
    online_cpus: SpinLock<CpuMask>,
}

impl SmpCpuManager {
    fn new() -> Self {
        let mut possible = CpuMask::new();
        for i in 0..PerCpu::MAX_CPU_NUM {
            possible.set(ProcessorId::new(i), true);
        }
        Self {
            possible_cpus: SpinLock::new(possible),
            online_cpus: SpinLock::new(CpuMask::new()),
        }
    }

    pub fn possible_cpus(&self) -> CpuMask {
        self.possible_cpus.lock_irqsave().clone()
    }

    /// 标记cpu上线/下线
    pub fn set_online(&self, cpu: ProcessorId, online: bool) {
        self.online_cpus.lock_irqsave().set(cpu, online);
    }

    pub fn is_online(&self, cpu: ProcessorId) -> bool {
        self.online_cpus.lock_irqsave().contains(cpu)
    }

    /// 在线cpu的位掩码（低64个cpu）
    pub fn online_mask_bits(&self) -> u64 {
        let mask = self.online_cpus.lock_irqsave();
        let mut bits = 0u64;
        for cpu in mask.iter_cpu() {
            if cpu.data() < 64 {
                bits |= 1 << cpu.data();
            }
        }
        return bits;
    }
}

static mut SMP_CPU_MANAGER: Option<SmpCpuManager> = None;

/// 初始化CPU管理器。只应在BSP早期调用一次
#[inline(never)]
pub fn smp_cpu_manager_init() {
    unsafe {
        debug_assert!(SMP_CPU_MANAGER.is_none());
        SMP_CPU_MANAGER = Some(SmpCpuManager::new());
    }
}

#[inline(always)]
pub fn smp_cpu_manager() -> &'static SmpCpuManager {
    unsafe { SMP_CPU_MANAGER.as_ref().unwrap() }
}
