//! Kernel error type: the ABI errno set, used directly.

pub use api::Errno;

pub type Result<T = ()> = core::result::Result<T, Errno>;
