pub mod align;
pub mod bits;
pub mod cpumask;
#[macro_use]
pub mod int_like;
pub mod spinlock;
