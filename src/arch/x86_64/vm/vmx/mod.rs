pub mod msr;
pub mod msr_bitmap;

pub use msr_bitmap::{
    enable_msr_interception, MsrInterceptMode, VmxMsrBitmap, VmxMsrBitmapAccess,
    VmxMsrBitmapAction,
};
