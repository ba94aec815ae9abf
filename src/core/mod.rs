//! 核心层：引擎错误与失败分类

pub mod error;

pub use error::{EngineError, ErrorType};
