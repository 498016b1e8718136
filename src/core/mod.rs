//! 核心层：错误类型、故障恢复策略、优雅关闭

pub mod error;
pub mod recovery;
pub mod shutdown;

pub use error::{AgentError, PlatformError, RecoveryAction, StoreError};
pub use recovery::RecoveryEngine;
pub use shutdown::{ShutdownManager, ShutdownReason};
