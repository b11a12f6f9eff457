pub mod early;
pub mod page_frame;
