//! IO 抽象层：HTTP 客户端与文件管理
//!
//! 核心只依赖这里的 trait；crate 同时提供基于 reqwest / tokio::fs 的
//! 默认实现，以及供测试使用的内存 mock 实现。

pub mod fs;
pub mod http;

pub use fs::{FileManager, TokioFileManager};
pub use http::{ByteStream, HttpClient, ReqwestHttpClient};
