//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE__*` 覆盖（双下划线表示嵌套，如 `BEE__AGENT__TYPE=codex`）。
//! 每个组件一个强类型配置段，启动时解码并校验一次。

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub engine: EngineSection,
    pub agent: AgentSection,
    pub platforms: PlatformsSection,
}

/// [app] 段：项目标识、工作目录、数据目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// 项目名，参与会话存储文件名的哈希
    pub project: String,
    /// Agent CLI 的工作目录
    pub work_dir: PathBuf,
    /// 会话存储目录，未设置时用 ~/.bee-connect
    pub data_dir: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            project: "default".to_string(),
            work_dir: PathBuf::from("."),
            data_dir: None,
        }
    }
}

impl AppSection {
    /// 展开 `~/` 前缀后的数据目录
    pub fn resolved_data_dir(&self) -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        match &self.data_dir {
            Some(dir) => expand_home(dir, &home),
            None => home.join(".bee-connect"),
        }
    }

    /// 绝对化后的工作目录（无法 canonicalize 时原样返回）
    pub fn resolved_work_dir(&self) -> PathBuf {
        std::fs::canonicalize(&self.work_dir).unwrap_or_else(|_| self.work_dir.clone())
    }
}

fn expand_home(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// [engine] 段：事件队列容量、重启次数、权限等待策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// 驱动读取任务与 Engine 之间的有界事件队列容量
    pub event_buffer: usize,
    /// `send` 发现进程已死时的透明重启次数
    pub max_restarts: u32,
    /// `/history` 默认条数
    pub history_limit: usize,
    /// 权限请求等待秒数；0 表示一直等待
    pub permission_timeout_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            event_buffer: 64,
            max_restarts: 1,
            history_limit: 10,
            permission_timeout_secs: 0,
        }
    }
}

/// [agent] 段：选用哪个后端以及各后端参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// claude / codex / gemini / cursor
    #[serde(rename = "type")]
    pub kind: String,
    pub claude: ClaudeSection,
    pub codex: CodexSection,
    pub gemini: GeminiSection,
    pub cursor: CursorSection,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            kind: "claude".to_string(),
            claude: ClaudeSection::default(),
            codex: CodexSection::default(),
            gemini: GeminiSection::default(),
            cursor: CursorSection::default(),
        }
    }
}

/// Claude Code 权限模式（原样传给 `--permission-mode`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ClaudeMode {
    #[default]
    Default,
    AcceptEdits,
    Plan,
    /// 驱动自动批准所有工具调用
    BypassPermissions,
}

impl ClaudeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaudeMode::Default => "default",
            ClaudeMode::AcceptEdits => "acceptEdits",
            ClaudeMode::Plan => "plan",
            ClaudeMode::BypassPermissions => "bypassPermissions",
        }
    }
}

/// [agent.claude]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClaudeSection {
    pub command: String,
    pub mode: ClaudeMode,
    pub model: Option<String>,
    pub allowed_tools: Vec<String>,
}

impl Default for ClaudeSection {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            mode: ClaudeMode::Default,
            model: None,
            allowed_tools: Vec::new(),
        }
    }
}

/// Codex 审批模式（启动参数决定，无带内握手）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CodexMode {
    #[default]
    Suggest,
    FullAuto,
    Yolo,
}

/// [agent.codex]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CodexSection {
    pub command: String,
    pub mode: CodexMode,
    pub model: Option<String>,
}

impl Default for CodexSection {
    fn default() -> Self {
        Self {
            command: "codex".to_string(),
            mode: CodexMode::Suggest,
            model: None,
        }
    }
}

/// Gemini CLI 审批模式（与 `--approval-mode` 取值一致）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GeminiMode {
    #[default]
    Default,
    AutoEdit,
    Yolo,
}

/// [agent.gemini]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeminiSection {
    pub command: String,
    pub mode: GeminiMode,
    pub model: Option<String>,
}

impl Default for GeminiSection {
    fn default() -> Self {
        Self {
            command: "gemini".to_string(),
            mode: GeminiMode::Default,
            model: None,
        }
    }
}

/// Cursor Agent 审批模式：force 对应 `--force`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CursorMode {
    #[default]
    Default,
    Force,
}

/// [agent.cursor]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CursorSection {
    pub command: String,
    pub mode: CursorMode,
    pub model: Option<String>,
}

impl Default for CursorSection {
    fn default() -> Self {
        Self {
            command: "cursor-agent".to_string(),
            mode: CursorMode::Default,
            model: None,
        }
    }
}

/// [platforms] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PlatformsSection {
    pub lark: LarkSection,
    pub whatsapp: WhatsappSection,
}

/// [platforms.lark]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LarkSection {
    pub enabled: bool,
    pub app_id: String,
    pub app_secret: String,
    /// 飞书 API 基地址（国际版用 https://open.larksuite.com）
    pub base_url: String,
    pub port: u16,
}

impl Default for LarkSection {
    fn default() -> Self {
        Self {
            enabled: false,
            app_id: String::new(),
            app_secret: String::new(),
            base_url: "https://open.feishu.cn".to_string(),
            port: 3001,
        }
    }
}

/// [platforms.whatsapp]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WhatsappSection {
    pub enabled: bool,
    pub access_token: String,
    pub phone_number_id: String,
    pub verify_token: String,
    pub port: u16,
}

impl Default for WhatsappSection {
    fn default() -> Self {
        Self {
            enabled: false,
            access_token: String::new(),
            phone_number_id: String::new(),
            verify_token: "bee".to_string(),
            port: 3002,
        }
    }
}

const KNOWN_AGENTS: &[&str] = &["claude", "codex", "gemini", "cursor"];

impl AppConfig {
    /// 校验跨字段约束；字段类型错误在反序列化阶段已拒绝
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if !KNOWN_AGENTS.contains(&self.agent.kind.as_str()) {
            return Err(config::ConfigError::Message(format!(
                "agent.type must be one of {:?}, got {:?}",
                KNOWN_AGENTS, self.agent.kind
            )));
        }
        if self.engine.event_buffer == 0 {
            return Err(config::ConfigError::Message(
                "engine.event_buffer must be greater than 0".to_string(),
            ));
        }
        let lark = &self.platforms.lark;
        if lark.enabled && (lark.app_id.is_empty() || lark.app_secret.is_empty()) {
            return Err(config::ConfigError::Message(
                "platforms.lark requires app_id and app_secret".to_string(),
            ));
        }
        let wa = &self.platforms.whatsapp;
        if wa.enabled && (wa.access_token.is_empty() || wa.phone_number_id.is_empty()) {
            return Err(config::ConfigError::Message(
                "platforms.whatsapp requires access_token and phone_number_id".to_string(),
            ));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 BEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!("Config file {:?} not found, ignoring", path);
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
