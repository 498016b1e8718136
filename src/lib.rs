//! Bee Connect - 把编码智能体 CLI 接入聊天平台
//!
//! 模块划分：
//! - **agent**: 后端驱动（Claude Code 常驻双工进程；Codex / Gemini / Cursor 每轮一个进程）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、故障恢复、优雅关闭
//! - **engine**: 对话编排（命令、权限交互、轮次锁、回复分段）
//! - **platform**: 聊天平台适配器（飞书 / WhatsApp）
//! - **session**: 会话注册表与持久化

pub mod agent;
pub mod config;
pub mod core;
pub mod engine;
pub mod platform;
pub mod session;

pub use engine::{Engine, EngineSettings};
