//! 利用控制台适配器（exploit_console）
//!
//! 有状态：控制台进程在编排器进程生命周期内常驻，会话 ID 与监听器状态跨调用保留。
//! 每条命令后紧跟一条回显唯一结束标记的命令，读取输出直到标记行出现；
//! 被取消的上一条命令的迟到输出在下一次调用中按旧标记切掉。进程退出后下次调用自动重启。

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};

use crate::config::ConsoleSection;
use crate::core::TargetIntel;
use crate::tools::{Tool, ToolContext};

static SESSION_OPENED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)session\s+(\d+)\s+opened").unwrap());

const MARKER_PREFIX: &str = "__REDAGENT_END_";

/// 控制台后端：向同一个常驻会话发送一条命令并返回其输出
#[async_trait]
pub trait ConsoleBackend: Send + Sync {
    async fn send(&self, command: &str) -> Result<String, String>;
}

struct ConsoleProcess {
    child: Child,
    stdin: ChildStdin,
    output: mpsc::UnboundedReceiver<String>,
}

/// 常驻子进程后端
pub struct ProcessConsole {
    binary: String,
    args: Vec<String>,
    idle: Duration,
    marker_command: String,
    command_timeout: Duration,
    process: Mutex<Option<ConsoleProcess>>,
}

impl ProcessConsole {
    pub fn new(section: &ConsoleSection) -> Self {
        Self {
            binary: section.binary.clone(),
            args: section.args.clone(),
            idle: Duration::from_millis(section.idle_ms),
            marker_command: section.marker_command.clone(),
            command_timeout: Duration::from_secs(section.command_timeout_secs),
            process: Mutex::new(None),
        }
    }

    fn spawn(&self) -> Result<ConsoleProcess, String> {
        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to start {}: {e}", self.binary))?;

        let stdin = child.stdin.take().ok_or("console stdin unavailable")?;
        let stdout = child.stdout.take().ok_or("console stdout unavailable")?;
        let stderr = child.stderr.take().ok_or("console stderr unavailable")?;
        let (tx, output) = mpsc::unbounded_channel();
        tokio::spawn(pump(stdout, tx.clone()));
        tokio::spawn(pump(stderr, tx));

        tracing::info!(binary = %self.binary, pid = ?child.id(), "console process started");
        Ok(ConsoleProcess { child, stdin, output })
    }

    /// 读取输出直到静默 idle；只用于丢弃启动横幅
    async fn drain(output: &mut mpsc::UnboundedReceiver<String>, idle: Duration) {
        while let Ok(Some(_)) = tokio::time::timeout(idle, output.recv()).await {}
    }

    /// 读取输出直到出现 marker 行；返回 (本条命令输出, 进程是否已关闭输出)
    async fn read_until_marker(output: &mut mpsc::UnboundedReceiver<String>, marker: &str) -> (String, bool) {
        let mut buf = String::new();
        loop {
            match output.recv().await {
                Some(chunk) => {
                    buf.push_str(&chunk);
                    if let Some(out) = command_output(&buf, marker) {
                        return (out, false);
                    }
                }
                None => return (strip_markers(&buf), true),
            }
        }
    }
}

/// marker 行之前属于本条命令的输出：从最后一个旧标记之后开始，去掉回显的标记命令
fn command_output(buf: &str, marker: &str) -> Option<String> {
    let lines: Vec<&str> = buf.lines().collect();
    let end = lines.iter().position(|l| l.trim() == marker)?;
    let start = lines[..end]
        .iter()
        .rposition(|l| is_marker_line(l))
        .map_or(0, |i| i + 1);
    Some(strip_markers(&lines[start..end].join("\n")))
}

fn is_marker_line(line: &str) -> bool {
    let l = line.trim();
    l.starts_with(MARKER_PREFIX) && l.ends_with("__")
}

fn strip_markers(text: &str) -> String {
    text.lines()
        .filter(|l| !l.contains(MARKER_PREFIX))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 解码一段字节；末尾不完整的 UTF-8 序列留在 pending 里等下一段
fn decode_utf8(pending: &mut Vec<u8>, bytes: &[u8]) -> String {
    pending.extend_from_slice(bytes);
    let split = pending.len() - incomplete_tail(pending);
    let text = String::from_utf8_lossy(&pending[..split]).into_owned();
    pending.drain(..split);
    text
}

/// 末尾被截断的多字节序列长度（0 表示完整）
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let b = bytes[bytes.len() - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let need = match b {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if need > back { back } else { 0 };
    }
    0
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut buf = [0u8; 4096];
    let mut pending = Vec::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let text = decode_utf8(&mut pending, &buf[..n]);
                if !text.is_empty() && tx.send(text).is_err() {
                    return;
                }
            }
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
    }
}

#[async_trait]
impl ConsoleBackend for ProcessConsole {
    async fn send(&self, command: &str) -> Result<String, String> {
        let mut guard = self.process.lock().await;
        if guard.is_none() {
            let mut proc = self.spawn()?;
            // 启动横幅不计入第一条命令
            Self::drain(&mut proc.output, self.idle).await;
            *guard = Some(proc);
        }
        let Some(proc) = guard.as_mut() else {
            return Err("console process unavailable".into());
        };

        while proc.output.try_recv().is_ok() {}

        let marker = format!("{MARKER_PREFIX}{}__", uuid::Uuid::new_v4().simple());
        let marker_command = self.marker_command.replace("{marker}", &marker);
        let written = async {
            proc.stdin.write_all(command.as_bytes()).await?;
            proc.stdin.write_all(b"\n").await?;
            proc.stdin.write_all(marker_command.as_bytes()).await?;
            proc.stdin.write_all(b"\n").await?;
            proc.stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            *guard = None;
            return Err(format!("console write failed: {e}"));
        }

        let read = Self::read_until_marker(&mut proc.output, &marker);
        let Ok((out, closed)) = tokio::time::timeout(self.command_timeout, read).await else {
            // 进程保留；迟到的输出在下一次调用时按标记丢弃
            return Err(format!(
                "console command timed out after {}s",
                self.command_timeout.as_secs()
            ));
        };
        if closed {
            let status = proc.child.wait().await.ok();
            tracing::warn!(status = ?status, "console process exited");
            *guard = None;
            if out.trim().is_empty() {
                return Err("console process exited".into());
            }
        }
        Ok(out)
    }
}

pub struct ConsoleTool {
    backend: Arc<dyn ConsoleBackend>,
}

impl ConsoleTool {
    pub fn new(backend: Arc<dyn ConsoleBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl Tool for ConsoleTool {
    fn name(&self) -> &str {
        "exploit_console"
    }

    fn description(&self) -> &str {
        "Run a command in the persistent exploitation console (msfconsole). State persists across calls: \
         `use <module>`, `set RHOSTS ...`, `exploit`, then `sessions -l` / `sessions -i N` in later calls."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "One console command" }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or("missing required argument: command")?;
        tracing::info!(session = %ctx.key, command = %command, "console command");
        let out = self.backend.send(command).await?;
        if out.trim().is_empty() {
            return Ok("(no output)".to_string());
        }
        Ok(out)
    }

    fn extract_intel(&self, output: &str) -> Option<TargetIntel> {
        let mut sessions: Vec<u32> = Vec::new();
        for cap in SESSION_OPENED.captures_iter(output) {
            if let Some(id) = cap.get(1).and_then(|m| m.as_str().parse().ok()) {
                if !sessions.contains(&id) {
                    sessions.push(id);
                }
            }
        }
        (!sessions.is_empty()).then(|| TargetIntel {
            sessions,
            ..Default::default()
        })
    }
}
