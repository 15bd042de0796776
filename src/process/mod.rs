//! 处理器与调度相关的外部接口

pub use cpu::{Cpus, PushOff};
pub use cpu::{cpus, install, push_off, pop_off};

mod cpu;

#[cfg(any(test, feature = "hosted"))]
pub mod host;
