//! 斜杠命令解析

/// 命令前缀
pub const COMMAND_PREFIX: char = '/';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 开始新的后端会话
    New,
    List,
    /// 切换到列表序号或 id 前缀对应的会话
    Switch(String),
    Current,
    History(Option<usize>),
    /// 无参数时显示当前免审批工具
    Allow(Option<String>),
    Quiet,
    Stop,
    Help,
    Unknown(String),
}

impl Command {
    /// 不以 '/' 开头的文本返回 None
    pub fn parse(text: &str) -> Option<Command> {
        let body = text.trim().strip_prefix(COMMAND_PREFIX)?;
        let mut parts = body.split_whitespace();
        let name = parts.next().unwrap_or("").to_lowercase();
        let arg = parts.next().map(str::to_string);
        let cmd = match name.as_str() {
            "new" => Command::New,
            "list" | "ls" => Command::List,
            "switch" => match arg {
                Some(target) => Command::Switch(target),
                None => Command::Unknown("switch".to_string()),
            },
            "current" => Command::Current,
            "history" => Command::History(arg.and_then(|a| a.parse().ok())),
            "allow" => Command::Allow(arg),
            "quiet" => Command::Quiet,
            "stop" => Command::Stop,
            "help" | "h" => Command::Help,
            other => Command::Unknown(other.to_string()),
        };
        Some(cmd)
    }
}

pub const HELP_TEXT: &str = "\
Commands:
/new - start a new agent session
/list - list agent sessions for this project
/switch <n|id> - switch to a listed session
/current - show the current session
/history [n] - show the last n messages
/allow [tool] - always allow a tool (or list allowed tools)
/quiet - toggle tool and thinking notices
/stop - stop the running turn
/help - show this help";
