#![no_std]

use num_derive::{FromPrimitive, ToPrimitive};

/// hypervisor核心会返回的错误码
///
/// 取值沿用posix errno的编号，但只保留本代码库真正会
/// 构造的那些；致命错误不走错误码，直接panic停机。
#[repr(i32)]
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Eq, Clone, Copy)]
#[allow(dead_code, non_camel_case_types)]
pub enum SystemError {
    /// 资源不可用，请重试 Resource unavailable, try again.
    EAGAIN_OR_EWOULDBLOCK = 11,
    /// 没有足够的空间 Not enough space.
    ENOMEM = 12,
    /// 错误的地址 Bad address.
    EFAULT = 14,
    /// 设备或资源忙 Device or resource busy.
    EBUSY = 16,
    /// 对象已存在 Object exists.
    EEXIST = 17,
    /// 没有指定的设备 No such device.
    ENODEV = 19,
    /// 不可用的参数 Invalid argument.
    EINVAL = 22,
    /// 资源池已耗尽 No space left.
    ENOSPC = 28,
}

impl SystemError {
    /// 返回posix约定的errno（负值）
    pub fn to_posix_errno(&self) -> i32 {
        return -<Self as num_traits::ToPrimitive>::to_i32(self).unwrap();
    }

    /// 从posix errno（负值）还原
    pub fn from_posix_errno(errno: i32) -> Option<SystemError> {
        if errno >= 0 {
            return None;
        }
        return <Self as num_traits::FromPrimitive>::from_i32(-errno);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_works() {
        assert_eq!(SystemError::EINVAL.to_posix_errno(), -22);
        assert_eq!(SystemError::ENOSPC.to_posix_errno(), -28);
        assert_eq!(
            SystemError::from_posix_errno(-16),
            Some(SystemError::EBUSY)
        );
        assert_eq!(SystemError::from_posix_errno(22), None);
        // 不在表里的errno还原不出来
        assert_eq!(SystemError::from_posix_errno(-1), None);
    }
}
