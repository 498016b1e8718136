//! 回复分段：按平台长度上限切分，优先在换行处断开

/// 把 `text` 切成每段不超过 `limit` 个字符的片段
///
/// 在窗口内最后一个换行处断开（换行本身丢弃）；窗口内没有换行时按字符硬切。
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        // 第 limit 个字符的字节偏移；None 表示剩余部分已放得下
        let Some((cut, _)) = rest.char_indices().nth(limit) else {
            chunks.push(rest.to_string());
            break;
        };
        // 换行恰好落在上限处时在此断开
        if rest[cut..].starts_with('\n') {
            chunks.push(rest[..cut].to_string());
            rest = &rest[cut + 1..];
            continue;
        }
        let window = &rest[..cut];
        match window.rfind('\n') {
            Some(nl) if nl > 0 => {
                chunks.push(window[..nl].to_string());
                rest = &rest[nl + 1..];
            }
            _ => {
                chunks.push(window.to_string());
                rest = &rest[cut..];
            }
        }
    }
    chunks
}
