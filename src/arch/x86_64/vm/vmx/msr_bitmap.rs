//! VMX的MSR拦截位图
//!
//! 4KiB一页，分成四个1KiB的象限：读低、读高、写低、写高。
//! 低区覆盖MSR `0x0..=0x1FFF`，高区覆盖`0xC0000000..=0xC0001FFF`。
//! 一个位管一个(MSR, 方向)，置位=VM-exit。布局是硬件契约，
//! 必须逐位精确。

use bitmap::{traits::BitMapOps, AllocBitmap};
use system_error::SystemError;

/// 位图总位数（4KiB页）
const MSR_BITMAP_BITS: usize = 4096 * 8;
/// 高区象限相对低区象限的位偏移（1KiB）
const HIGH_QUADRANT_BIT_OFFSET: usize = 1024 * 8;

pub enum VmxMsrBitmapAction {
    Test,
    Set,
    Clear,
}

#[derive(Debug, Clone, Copy)]
pub enum VmxMsrBitmapAccess {
    Read,
    Write,
}

impl VmxMsrBitmapAccess {
    /// 该方向的位图起始位偏移：读在0，写在2KiB处
    pub const fn base(&self) -> usize {
        match self {
            VmxMsrBitmapAccess::Read => 0,
            VmxMsrBitmapAccess::Write => 2 * 1024 * 8,
        }
    }
}

/// MSR拦截模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrInterceptMode {
    /// 拦截读
    Read,
    /// 拦截写
    Write,
    /// 读写都拦截
    ReadWrite,
    /// 两个方向都放行
    Disable,
}

#[derive(Debug)]
pub struct VmxMsrBitmap {
    data: AllocBitmap,
}

impl Default for VmxMsrBitmap {
    fn default() -> Self {
        Self::new(false)
    }
}

impl VmxMsrBitmap {
    pub fn new(init_val: bool) -> Self {
        let mut data = AllocBitmap::new(MSR_BITMAP_BITS);
        data.set_all(init_val);
        Self { data }
    }

    /// 计算(MSR, 方向)对应的位下标。范围之外的MSR被拒绝
    fn bit_index(msr: u32, access: VmxMsrBitmapAccess) -> Result<usize, SystemError> {
        if msr <= 0x1FFF {
            return Ok(access.base() + msr as usize);
        }
        if (0xC000_0000..=0xC000_1FFF).contains(&msr) {
            return Ok(access.base() + HIGH_QUADRANT_BIT_OFFSET + (msr - 0xC000_0000) as usize);
        }
        return Err(SystemError::EINVAL);
    }

    /// 对一个(MSR, 方向)位执行测试/置位/清位
    pub fn ctl(
        &mut self,
        msr: u32,
        action: VmxMsrBitmapAction,
        access: VmxMsrBitmapAccess,
    ) -> Result<bool, SystemError> {
        let index = Self::bit_index(msr, access)?;
        match action {
            VmxMsrBitmapAction::Test => {
                return Ok(self.data.get(index).unwrap_or(false));
            }
            VmxMsrBitmapAction::Set => {
                self.data.set(index, true);
                return Ok(true);
            }
            VmxMsrBitmapAction::Clear => {
                self.data.set(index, false);
                return Ok(true);
            }
        }
    }

    /// 查询某个方向是否被拦截
    pub fn is_intercepted(&self, msr: u32, access: VmxMsrBitmapAccess) -> bool {
        match Self::bit_index(msr, access) {
            Ok(index) => self.data.get(index).unwrap_or(false),
            Err(_) => false,
        }
    }

    /// 位图页的裸字节（写进VMCS的MSR_BITMAP字段前由调用方
    /// 转成物理地址）
    pub fn as_bytes(&self) -> &[u8] {
        self.data.as_bytes()
    }
}

/// 设置MSR的拦截模式
///
/// `Read`/`Write`只动自己方向的位；`ReadWrite`两个都置位；
/// `Disable`两个都清零。MSR落在两个合法区间之外时整个位图
/// 保持不变并返回EINVAL。
pub fn enable_msr_interception(
    bitmap: &mut VmxMsrBitmap,
    msr: u32,
    mode: MsrInterceptMode,
) -> Result<(), SystemError> {
    // 先验证范围，保证出错时位图不变
    VmxMsrBitmap::bit_index(msr, VmxMsrBitmapAccess::Read)?;

    match mode {
        MsrInterceptMode::Read => {
            bitmap.ctl(msr, VmxMsrBitmapAction::Set, VmxMsrBitmapAccess::Read)?;
        }
        MsrInterceptMode::Write => {
            bitmap.ctl(msr, VmxMsrBitmapAction::Set, VmxMsrBitmapAccess::Write)?;
        }
        MsrInterceptMode::ReadWrite => {
            bitmap.ctl(msr, VmxMsrBitmapAction::Set, VmxMsrBitmapAccess::Read)?;
            bitmap.ctl(msr, VmxMsrBitmapAction::Set, VmxMsrBitmapAccess::Write)?;
        }
        MsrInterceptMode::Disable => {
            bitmap.ctl(msr, VmxMsrBitmapAction::Clear, VmxMsrBitmapAccess::Read)?;
            bitmap.ctl(msr, VmxMsrBitmapAction::Clear, VmxMsrBitmapAccess::Write)?;
        }
    }
    return Ok(());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn byte_bit(bytes: &[u8], byte: usize, bit: usize) -> bool {
        bytes[byte] & (1 << bit) != 0
    }

    #[test]
    fn test_quadrant_layout_high_msr() {
        // S6：EFER(0xC0000080)在高区，偏移0x80位 = 16字节
        let mut bitmap = VmxMsrBitmap::new(false);
        enable_msr_interception(&mut bitmap, 0xC000_0080, MsrInterceptMode::ReadWrite).unwrap();
        let bytes = bitmap.as_bytes();
        // 读高象限从1024字节开始
        assert!(byte_bit(bytes, 1024 + 16, 0));
        // 写高象限从3072字节开始
        assert!(byte_bit(bytes, 3072 + 16, 0));
        // 其余象限不受影响
        assert!(!byte_bit(bytes, 16, 0));
        assert!(!byte_bit(bytes, 2048 + 16, 0));
    }

    #[test]
    fn test_quadrant_layout_low_msr() {
        let mut bitmap = VmxMsrBitmap::new(false);
        // PAT = 0x277 → 字节0x4E，位7
        enable_msr_interception(&mut bitmap, 0x277, MsrInterceptMode::Write).unwrap();
        let bytes = bitmap.as_bytes();
        assert!(byte_bit(bytes, 2048 + 0x4E, 7));
        assert!(!byte_bit(bytes, 0x4E, 7));
    }

    #[test]
    fn test_mode_semantics() {
        let mut bitmap = VmxMsrBitmap::new(false);
        let msr = 0x1A0;
        // R只置读位，写位不动
        enable_msr_interception(&mut bitmap, msr, MsrInterceptMode::Read).unwrap();
        assert!(bitmap.is_intercepted(msr, VmxMsrBitmapAccess::Read));
        assert!(!bitmap.is_intercepted(msr, VmxMsrBitmapAccess::Write));

        enable_msr_interception(&mut bitmap, msr, MsrInterceptMode::Write).unwrap();
        assert!(bitmap.is_intercepted(msr, VmxMsrBitmapAccess::Read));
        assert!(bitmap.is_intercepted(msr, VmxMsrBitmapAccess::Write));

        // NONE两个方向都清掉
        enable_msr_interception(&mut bitmap, msr, MsrInterceptMode::Disable).unwrap();
        assert!(!bitmap.is_intercepted(msr, VmxMsrBitmapAccess::Read));
        assert!(!bitmap.is_intercepted(msr, VmxMsrBitmapAccess::Write));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut bitmap = VmxMsrBitmap::new(false);
        for msr in [0x2000u32, 0xBFFF_FFFF, 0xC000_2000, 0xFFFF_FFFF] {
            let err = enable_msr_interception(&mut bitmap, msr, MsrInterceptMode::ReadWrite);
            assert_eq!(err, Err(SystemError::EINVAL));
        }
        // 位图保持全零
        assert!(bitmap.as_bytes().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_boundary_msrs() {
        let mut bitmap = VmxMsrBitmap::new(false);
        enable_msr_interception(&mut bitmap, 0x1FFF, MsrInterceptMode::Read).unwrap();
        enable_msr_interception(&mut bitmap, 0xC000_1FFF, MsrInterceptMode::Read).unwrap();
        let bytes = bitmap.as_bytes();
        // 0x1FFF是读低象限的最后一位
        assert!(byte_bit(bytes, 1023, 7));
        // 0xC0001FFF是读高象限的最后一位
        assert!(byte_bit(bytes, 2047, 7));
    }
}
