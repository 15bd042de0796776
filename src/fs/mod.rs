//! 文件系统的块缓存层

mod bio;

pub use bio::{Bcache, Buf, BufData};
