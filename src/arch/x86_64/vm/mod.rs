pub mod ept;
pub mod vmx;
