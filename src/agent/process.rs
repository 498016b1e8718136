//! 子进程工具：命令描述、stdout 行读取、stderr 收集、协议行解码接口、图片临时文件

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::Event;
use crate::core::AgentError;
use crate::platform::ImageAttachment;

/// 出错时保留的 stderr 尾部行数
const STDERR_TAIL_LINES: usize = 20;

/// 要启动的后端命令
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// 值存在时追加 `flag value`
    pub fn opt(self, flag: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.arg(flag).arg(v),
            None => self,
        }
    }

    /// 启动子进程；stdout/stderr 总是管道，stdin 仅双工驱动需要
    ///
    /// 子进程随 Child 一起被回收（kill_on_drop），启动失败同步返回 `AgentError::Spawn`。
    /// Unix 下子进程是新进程组的组长，见 [`kill_process_group`]。
    pub fn spawn(&self, with_stdin: bool) -> Result<Child, AgentError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .stdin(if with_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // 独立进程组，关闭时连同后台孙进程一起终止
        #[cfg(unix)]
        cmd.process_group(0);
        tracing::debug!(program = %self.program, args = ?self.args, cwd = ?self.cwd, "Spawning agent process");
        cmd.spawn().map_err(|source| AgentError::Spawn {
            command: self.program.clone(),
            source,
        })
    }
}

/// 按行读取子进程输出；非 UTF-8 字节按有损方式转换，不中断读取
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// 下一行（去掉行尾换行）；EOF 返回 None
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        let n = self.inner.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        let line = String::from_utf8_lossy(&self.buf);
        Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
    }
}

/// stderr 收集任务在进程退出后的最长等待；后台孙进程可能一直持有管道
const STDERR_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

fn lock_tail(tail: &Mutex<VecDeque<String>>) -> std::sync::MutexGuard<'_, VecDeque<String>> {
    tail.lock().unwrap_or_else(|e| e.into_inner())
}

/// 后台收集的 stderr 尾部
pub struct StderrTail {
    tail: Arc<Mutex<VecDeque<String>>>,
    task: JoinHandle<()>,
}

impl StderrTail {
    /// 等待收集任务结束（有上限），超时后放弃读取，返回已收集的尾部
    pub async fn finish(mut self) -> String {
        if tokio::time::timeout(STDERR_JOIN_TIMEOUT, &mut self.task)
            .await
            .is_err()
        {
            self.task.abort();
        }
        lock_tail(&self.tail).iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// 后台收集 stderr：每行以 debug 记录，保留最后若干行
pub fn collect_stderr(agent: &'static str, stderr: ChildStderr) -> StderrTail {
    let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    let shared = Arc::clone(&tail);
    let task = tokio::spawn(async move {
        let mut reader = LineReader::new(stderr);
        while let Ok(Some(line)) = reader.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            tracing::debug!(agent, "stderr: {}", line);
            let mut tail = lock_tail(&shared);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    });
    StderrTail { tail, task }
}

pub async fn finish_stderr(stderr: Option<StderrTail>) -> String {
    match stderr {
        Some(tail) => tail.finish().await,
        None => String::new(),
    }
}

/// 终止子进程所在的整个进程组，工具调用留下的后台进程一并结束
pub fn kill_process_group(agent: &str, child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                tracing::debug!(agent, "Failed to kill process group: {}", e);
            }
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(agent, "Failed to kill agent process: {}", e);
    }
}

/// 回收子进程；取消时先终止进程组
pub async fn reap(
    agent: &str,
    child: &mut Child,
    cancel: &CancellationToken,
) -> std::io::Result<ExitStatus> {
    if !cancel.is_cancelled() {
        tokio::select! {
            status = child.wait() => return status,
            _ = cancel.cancelled() => {}
        }
    }
    kill_process_group(agent, child);
    child.wait().await
}

/// 一行协议输出的解码结果
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(Event),
    /// 后端报告了会话 / 线程 id
    SessionStarted(String),
    /// 后端请求工具许可（仅双工后端）
    PermissionAsk {
        request_id: String,
        tool: String,
        input: Value,
    },
    PermissionCancelled { request_id: String },
}

/// 后端协议解码器：每行 JSON 产生零个或多个结果，畸形行跳过
pub trait LineDecoder: Send + 'static {
    fn decode(&mut self, line: &str) -> Vec<Decoded>;
}

/// 把一行解码成协议枚举；空行与解码失败返回 None 并记录 debug 日志
pub fn parse_line<T: DeserializeOwned>(agent: &str, line: &str) -> Option<T> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(agent, error = %e, "Skipping unparseable line: {}", line);
            None
        }
    }
}

fn image_extension(mime_type: &str) -> &'static str {
    match mime_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "bin",
    }
}

/// 把图片写到临时目录，供只接受文件路径的后端引用
pub fn write_temp_images(images: &[ImageAttachment]) -> Result<Vec<PathBuf>, AgentError> {
    if images.is_empty() {
        return Ok(Vec::new());
    }
    let dir = std::env::temp_dir().join("bee-connect");
    std::fs::create_dir_all(&dir)
        .map_err(|e| AgentError::Attachment(format!("create {}: {}", dir.display(), e)))?;
    let mut paths = Vec::with_capacity(images.len());
    for image in images {
        let path = dir.join(format!(
            "{}.{}",
            uuid::Uuid::new_v4(),
            image_extension(&image.mime_type)
        ));
        if let Err(e) = std::fs::write(&path, &image.data) {
            remove_temp_files(&paths);
            return Err(AgentError::Attachment(format!(
                "write {}: {}",
                path.display(),
                e
            )));
        }
        paths.push(path);
    }
    Ok(paths)
}

pub fn remove_temp_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::debug!("Failed to remove temp file {}: {}", path.display(), e);
        }
    }
}

/// 在 prompt 后追加 `@path` 形式的图片引用
pub fn prompt_with_image_refs(prompt: &str, paths: &[PathBuf], prefix: &str) -> String {
    let refs: Vec<String> = paths
        .iter()
        .map(|p: &PathBuf| format!("{}{}", prefix, display_path(p)))
        .collect();
    if refs.is_empty() {
        prompt.to_string()
    } else {
        format!("{}\n\n{}", prompt, refs.join(" "))
    }
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn test_parse_line_skips_garbage() {
        assert_eq!(parse_line::<Ping>("test", r#"{"n": 3}"#), Some(Ping { n: 3 }));
        assert_eq!(parse_line::<Ping>("test", "not json"), None);
        assert_eq!(parse_line::<Ping>("test", "   "), None);
    }

    #[test]
    fn test_command_spec_opt() {
        let spec = CommandSpec::new("codex", "/tmp")
            .arg("exec")
            .opt("--model", Some("o3"))
            .opt("--profile", None);
        assert_eq!(spec.args, vec!["exec", "--model", "o3"]);
    }

    #[tokio::test]
    async fn test_line_reader_lossy() {
        let data: &[u8] = b"one\r\ntw\xffo\nlast";
        let mut reader = LineReader::new(data);
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("tw\u{fffd}o"));
        assert_eq!(reader.next_line().await.unwrap().as_deref(), Some("last"));
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[test]
    fn test_temp_images_round_trip() {
        let images = vec![ImageAttachment {
            mime_type: "image/png".to_string(),
            data: vec![1, 2, 3],
            file_name: None,
        }];
        let paths = write_temp_images(&images).unwrap();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].extension().is_some_and(|e| e == "png"));
        assert_eq!(std::fs::read(&paths[0]).unwrap(), vec![1, 2, 3]);

        let prompt = prompt_with_image_refs("look", &paths, "@");
        assert!(prompt.starts_with("look\n\n@"));

        remove_temp_files(&paths);
        assert!(!paths[0].exists());
    }

    #[test]
    fn test_spawn_missing_binary() {
        let spec = CommandSpec::new("definitely-not-a-real-agent-binary", ".");
        let rt = tokio::runtime::Runtime::new().unwrap();
        let result = rt.block_on(async { spec.spawn(false).map(|_| ()) });
        assert!(matches!(result, Err(AgentError::Spawn { .. })));
    }
}
