//! Agent 注册表：后端类型名 → 构造函数，启动时创建一次后按值传给使用方

use std::collections::HashMap;
use std::sync::Arc;

use crate::agent::claude::ClaudeAgent;
use crate::agent::codex::CodexAgent;
use crate::agent::cursor::CursorAgent;
use crate::agent::gemini::GeminiAgent;
use crate::agent::{Agent, AgentContext};
use crate::config::AgentSection;
use crate::core::AgentError;

pub type AgentFactory = fn(&AgentSection, AgentContext) -> Result<Arc<dyn Agent>, AgentError>;

pub struct AgentRegistry {
    factories: HashMap<&'static str, AgentFactory>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// 注册内置的四种后端
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("claude", |cfg, ctx| {
            Ok(Arc::new(ClaudeAgent::new(cfg.claude.clone(), ctx)))
        });
        registry.register("codex", |cfg, ctx| {
            Ok(Arc::new(CodexAgent::new(cfg.codex.clone(), ctx)))
        });
        registry.register("gemini", |cfg, ctx| {
            Ok(Arc::new(GeminiAgent::new(cfg.gemini.clone(), ctx)))
        });
        registry.register("cursor", |cfg, ctx| {
            Ok(Arc::new(CursorAgent::new(cfg.cursor.clone(), ctx)))
        });
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: AgentFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// 按 `[agent].type` 创建后端
    pub fn create(
        &self,
        config: &AgentSection,
        ctx: AgentContext,
    ) -> Result<Arc<dyn Agent>, AgentError> {
        let factory = self
            .factories
            .get(config.kind.as_str())
            .ok_or_else(|| AgentError::UnknownAgent(config.kind.clone()))?;
        let agent = factory(config, ctx)?;
        tracing::info!(agent = agent.name(), "Agent backend created");
        Ok(agent)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
