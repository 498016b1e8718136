//! 会话存储文件：单个 JSON 文件，按项目 + 工作目录哈希命名，原子写入

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::core::StoreError;
use crate::session::HistoryEntry;

/// 一个对话键的持久化记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// 后端分配的会话 id，空串表示尚未分配
    #[serde(default)]
    pub agent_session_id: String,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// 文件内容：`{"sessions": {KEY: {...}}}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreData {
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionRecord>,
}

#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
}

/// 项目名中只保留字母数字、'-'、'_'
fn sanitize(project: &str) -> String {
    project
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data_dir>/sessions/<project>_<sha256(project \0 work_dir) 前 8 字节>.json`
    ///
    /// 同一项目的不同工作目录落到不同文件。
    pub fn for_project(data_dir: &Path, project: &str, work_dir: &Path) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(project.as_bytes());
        hasher.update([0u8]);
        hasher.update(work_dir.to_string_lossy().as_bytes());
        let digest = hasher.finalize();
        let name = format!("{}_{}.json", sanitize(project), hex::encode(&digest[..8]));
        Self::new(data_dir.join("sessions").join(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 文件不存在时返回空数据
    pub fn load(&self) -> Result<StoreData, StoreError> {
        if !self.path.exists() {
            return Ok(StoreData::default());
        }
        let text = std::fs::read_to_string(&self.path)?;
        if text.trim().is_empty() {
            return Ok(StoreData::default());
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// 异步写入：先写 `<file>.tmp` 再 rename 覆盖
    pub async fn save(&self, data: &StoreData) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let text = serde_json::to_string_pretty(data)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, text).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
