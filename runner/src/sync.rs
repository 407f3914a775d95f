pub mod locking;
pub mod study;
