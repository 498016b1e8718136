//! 错误恢复引擎
//!
//! 根据 AgentError 类型与已重启次数返回 RecoveryAction：进程死亡时透明重启，其它错误直接告知用户。

use crate::core::{AgentError, RecoveryAction};

/// 驱动故障的恢复策略；重启次数上限来自 `[engine].max_restarts`
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    max_restarts: u32,
}

impl RecoveryEngine {
    pub fn new(max_restarts: u32) -> Self {
        Self { max_restarts }
    }

    /// `send` 失败后的动作；`attempts` 为本轮已经做过的重启次数
    pub fn on_send_failure(&self, err: &AgentError, attempts: u32) -> RecoveryAction {
        if err.is_process_dead() && attempts < self.max_restarts {
            return RecoveryAction::Restart;
        }
        match err {
            AgentError::Spawn { command, .. } => RecoveryAction::Surface(format!(
                "Failed to start `{command}`. Is it installed and on PATH?"
            )),
            AgentError::NotAlive | AgentError::StdinWrite(_) => RecoveryAction::Surface(
                "The agent process keeps exiting. Try again later or send /new.".to_string(),
            ),
            other => RecoveryAction::Surface(other.to_string()),
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(1)
    }
}
