//! 工具调度器
//!
//! dispatch(tool, args, phase) 先经 ToolPhasePolicy 校验（拒绝时不触发任何外部副作用），
//! 再在超时内调用适配器；可重试的适配器失败后按退避重试，上限耗尽即为失败结果而非崩溃。
//! 输出截断到配置的最大字符数；每次调用输出一条结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::{AgentError, Phase, TargetIntel};
use crate::session::SessionKey;
use crate::tools::{PolicyConfigError, Tool, ToolContext, ToolPhasePolicy, ToolRegistry};

/// 重试策略：首次等待 backoff，之后每次翻倍
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    /// 第 retry 次重试前的等待（retry 从 1 开始）
    pub fn delay(&self, retry: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << retry.saturating_sub(1).min(16))
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub timeout: Duration,
    pub max_output_chars: usize,
    pub retry: RetryPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_output_chars: 8000,
            retry: RetryPolicy {
                max_retries: 3,
                backoff: Duration::from_millis(500),
            },
        }
    }
}

/// 一次调度的结果；无论成功失败都会成为恰好一个轨迹步骤
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub tool: String,
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    /// 实际调用适配器的次数；策略拒绝时为 0
    pub attempts: u32,
    pub truncated: bool,
    pub denied: bool,
    pub intel: Option<TargetIntel>,
}

impl ToolOutcome {
    fn failure(tool: &str, err: &AgentError, attempts: u32) -> Self {
        Self {
            tool: tool.to_string(),
            success: false,
            output: None,
            error: Some(err.to_string()),
            attempts,
            truncated: false,
            denied: matches!(err, AgentError::PolicyDenied(_) | AgentError::UnknownTool(_)),
            intel: None,
        }
    }

    /// 写入对话的观察文本
    pub fn observation(&self) -> String {
        match (&self.output, &self.error) {
            (Some(out), _) if self.success => out.clone(),
            (_, Some(err)) => format!("Error: {err}"),
            _ => "(no output)".to_string(),
        }
    }
}

/// 截断到 max 个字符，附带被截去的字符数
pub fn truncate_output(output: &str, max: usize) -> (String, bool) {
    let total = output.chars().count();
    if total <= max {
        return (output.to_string(), false);
    }
    let head: String = output.chars().take(max).collect();
    (
        format!("{head}\n...[truncated {} chars]", total - max),
        true,
    )
}

pub struct ToolDispatcher {
    registry: ToolRegistry,
    policy: ToolPhasePolicy,
    settings: DispatchSettings,
}

impl ToolDispatcher {
    /// 创建调度器；已注册工具缺少阶段映射时启动失败
    pub fn new(
        registry: ToolRegistry,
        policy: ToolPhasePolicy,
        settings: DispatchSettings,
    ) -> Result<Self, PolicyConfigError> {
        policy.ensure_covers(&registry.tool_names())?;
        Ok(Self {
            registry,
            policy,
            settings,
        })
    }

    pub fn policy(&self) -> &ToolPhasePolicy {
        &self.policy
    }

    /// 当前阶段可用工具的 (name, description, parameters_schema)
    pub fn tools_for_phase(&self, phase: Phase) -> Vec<(String, String, serde_json::Value)> {
        self.policy
            .tools_for_phase(phase)
            .into_iter()
            .filter_map(|name| self.registry.get(name))
            .map(|t| (t.name().to_string(), t.description().to_string(), t.parameters_schema()))
            .collect()
    }

    pub async fn dispatch(
        &self,
        tool_name: &str,
        args: serde_json::Value,
        phase: Phase,
        key: &SessionKey,
    ) -> ToolOutcome {
        let start = Instant::now();
        let args_preview = args_preview(&args);

        let checked = self.policy.check(tool_name, phase).and_then(|_| {
            self.registry
                .get(tool_name)
                .ok_or_else(|| AgentError::UnknownTool(tool_name.to_string()))
        });
        let tool = match checked {
            Ok(t) => t,
            Err(e) => {
                audit(tool_name, phase, "denied", 0, start, &args_preview);
                tracing::warn!(session = %key, tool = %tool_name, phase = %phase, "{e}");
                return ToolOutcome::failure(tool_name, &e, 0);
            }
        };

        let (result, attempts) = self.invoke_with_retry(tool.as_ref(), args, key).await;
        match result {
            Ok(raw) => {
                let intel = tool.extract_intel(&raw).filter(|i| !i.is_empty());
                let (output, truncated) = truncate_output(&raw, self.settings.max_output_chars);
                audit(tool_name, phase, "ok", attempts, start, &args_preview);
                ToolOutcome {
                    tool: tool_name.to_string(),
                    success: true,
                    output: Some(output),
                    error: None,
                    attempts,
                    truncated,
                    denied: false,
                    intel,
                }
            }
            Err(e) => {
                let outcome = match e {
                    AgentError::ToolTimeout { .. } => "timeout",
                    _ => "error",
                };
                audit(tool_name, phase, outcome, attempts, start, &args_preview);
                ToolOutcome::failure(tool_name, &e, attempts)
            }
        }
    }

    async fn invoke_with_retry(
        &self,
        tool: &dyn Tool,
        args: serde_json::Value,
        key: &SessionKey,
    ) -> (Result<String, AgentError>, u32) {
        let retries = if tool.retryable() {
            self.settings.retry.max_retries
        } else {
            0
        };
        let mut ctx = ToolContext::new(key.clone());
        loop {
            match self.invoke_once(tool, args.clone(), &ctx).await {
                Ok(out) => return (Ok(out), ctx.attempt),
                Err(e) if ctx.attempt > retries => {
                    let err = if retries == 0 {
                        e
                    } else {
                        AgentError::RetriesExhausted {
                            tool: tool.name().to_string(),
                            attempts: ctx.attempt,
                            last_error: e.to_string(),
                        }
                    };
                    return (Err(err), ctx.attempt);
                }
                Err(e) => {
                    let delay = self.settings.retry.delay(ctx.attempt);
                    tracing::warn!(
                        session = %key,
                        tool = %tool.name(),
                        attempt = ctx.attempt,
                        "tool failed, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    ctx.attempt += 1;
                    ctx.previous_error = Some(e.to_string());
                }
            }
        }
    }

    async fn invoke_once(
        &self,
        tool: &dyn Tool,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<String, AgentError> {
        match timeout(self.settings.timeout, tool.execute(args, ctx)).await {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(message)) => Err(AgentError::ToolExecutionFailed {
                tool: tool.name().to_string(),
                message,
            }),
            Err(_) => Err(AgentError::ToolTimeout {
                tool: tool.name().to_string(),
                secs: self.settings.timeout.as_secs(),
            }),
        }
    }
}

fn audit(tool: &str, phase: Phase, outcome: &str, attempts: u32, start: Instant, args_preview: &str) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": tool,
        "phase": phase.as_str(),
        "ok": outcome == "ok",
        "outcome": outcome,
        "attempts": attempts,
        "duration_ms": start.elapsed().as_millis() as u64,
        "args_preview": args_preview,
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Value};

    /// 计数工具：前 fail_first 次失败，之后返回 output
    struct Flaky {
        name: &'static str,
        retryable: bool,
        fail_first: u32,
        output: String,
        calls: Arc<AtomicU32>,
        seen_errors: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl Flaky {
        fn new(name: &'static str, fail_first: u32, retryable: bool) -> Self {
            Self {
                name,
                retryable,
                fail_first,
                output: "ok".into(),
                calls: Arc::new(AtomicU32::new(0)),
                seen_errors: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Tool for Flaky {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "flaky"
        }

        fn retryable(&self) -> bool {
            self.retryable
        }

        async fn execute(&self, _args: Value, ctx: &ToolContext) -> Result<String, String> {
            self.seen_errors.lock().unwrap().push(ctx.previous_error.clone());
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                Err(format!("failure {n}"))
            } else {
                Ok(self.output.clone())
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl Tool for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "sleeps"
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<String, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            timeout: Duration::from_millis(100),
            max_output_chars: 10,
            retry: RetryPolicy {
                max_retries: 2,
                backoff: Duration::from_millis(1),
            },
        }
    }

    fn key() -> SessionKey {
        SessionKey::new("u", "p", "s")
    }

    fn dispatcher(tool: impl Tool + 'static, phases: &[Phase]) -> ToolDispatcher {
        let name = tool.name().to_string();
        let mut reg = ToolRegistry::new();
        reg.register(tool);
        ToolDispatcher::new(reg, ToolPhasePolicy::default().allow(name, phases), settings()).unwrap()
    }

    #[tokio::test]
    async fn test_denied_call_never_reaches_adapter() {
        let tool = Flaky::new("exploit_console", 0, false);
        let calls = tool.calls.clone();
        let d = dispatcher(tool, &[Phase::Exploitation, Phase::PostExploitation]);
        let out = d
            .dispatch("exploit_console", json!({"command": "sessions -l"}), Phase::Informational, &key())
            .await;
        assert!(!out.success);
        assert!(out.denied);
        assert_eq!(out.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(out.error.unwrap().contains("exploitation"));
    }

    #[tokio::test]
    async fn test_retryable_tool_recovers() {
        let tool = Flaky::new("query_graph", 2, true);
        let seen = tool.seen_errors.clone();
        let d = dispatcher(tool, &Phase::ALL);
        let out = d.dispatch("query_graph", json!({}), Phase::Informational, &key()).await;
        assert!(out.success);
        assert_eq!(out.attempts, 3);
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], None);
        assert!(seen[2].as_deref().unwrap().contains("failure 2"));
    }

    #[tokio::test]
    async fn test_retries_are_capped() {
        let tool = Flaky::new("query_graph", 10, true);
        let calls = tool.calls.clone();
        let d = dispatcher(tool, &Phase::ALL);
        let out = d.dispatch("query_graph", json!({}), Phase::Informational, &key()).await;
        assert!(!out.success);
        assert_eq!(out.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(out.error.unwrap().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_non_retryable_tool_runs_once() {
        let tool = Flaky::new("port_scan", 1, false);
        let calls = tool.calls.clone();
        let d = dispatcher(tool, &Phase::ALL);
        let out = d.dispatch("port_scan", json!({}), Phase::Informational, &key()).await;
        assert!(!out.success);
        assert!(!out.denied);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let d = dispatcher(Slow, &Phase::ALL);
        let out = d.dispatch("slow", json!({}), Phase::Exploitation, &key()).await;
        assert!(!out.success);
        assert!(out.error.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_output_truncated() {
        let mut tool = Flaky::new("http_request", 0, false);
        tool.output = "0123456789abcdef".into();
        let d = dispatcher(tool, &Phase::ALL);
        let out = d.dispatch("http_request", json!({}), Phase::Informational, &key()).await;
        assert!(out.truncated);
        assert_eq!(out.output.unwrap(), "0123456789\n...[truncated 6 chars]");
    }

    #[test]
    fn test_unmapped_tool_fails_startup() {
        let mut reg = ToolRegistry::new();
        reg.register(Slow);
        assert!(ToolDispatcher::new(reg, ToolPhasePolicy::default(), settings()).is_err());
    }

    #[test]
    fn test_backoff_doubles() {
        let p = RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(3), Duration::from_millis(400));
    }
}
