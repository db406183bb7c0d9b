//! 编排器端到端测试：脚本化 LLM + 计数假工具，覆盖审批协议、阶段策略、预算与检查点恢复

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use redagent::config::AppConfig;
use redagent::core::{ApprovalDecision, Orchestrator, OrchestratorBuilder, OrchestratorError, Phase, ABORTED_BY_USER};
use redagent::llm::{MockLlmClient, ScriptedLlmClient};
use redagent::session::{MemorySessionStore, SessionKey, SessionStore, SqliteSessionStore};
use redagent::tools::{Tool, ToolContext};

struct CountingTool {
    name: &'static str,
    output: &'static str,
    calls: Arc<AtomicUsize>,
}

impl CountingTool {
    fn new(name: &'static str, output: &'static str) -> (Arc<Self>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let tool = Arc::new(Self {
            name,
            output,
            calls: calls.clone(),
        });
        (tool, calls)
    }
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "counting test tool"
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.to_string())
    }
}

struct Harness {
    orchestrator: Orchestrator,
    llm: Arc<ScriptedLlmClient>,
    graph_calls: Arc<AtomicUsize>,
    console_calls: Arc<AtomicUsize>,
}

fn harness_with(max_iterations: u32, replies: Vec<String>, store: Arc<dyn SessionStore>) -> Harness {
    let mut cfg = AppConfig::default();
    cfg.agent.max_iterations = max_iterations;
    let llm = Arc::new(ScriptedLlmClient::new(replies));
    let (graph, graph_calls) = CountingTool::new("query_graph", "10.0.0.5:443 apache 2.4.49");
    let (console, console_calls) = CountingTool::new("exploit_console", "[*] Meterpreter session 1 opened");
    let orchestrator = OrchestratorBuilder::new(cfg)
        .with_llm(llm.clone())
        .with_store(store)
        .without_default_tools()
        .with_tool(graph)
        .with_tool(console)
        .build()
        .unwrap();
    Harness {
        orchestrator,
        llm,
        graph_calls,
        console_calls,
    }
}

fn harness(max_iterations: u32, replies: Vec<String>) -> Harness {
    harness_with(max_iterations, replies, Arc::new(MemorySessionStore::new()))
}

fn key() -> SessionKey {
    SessionKey::new("tenant-a", "project-1", "session-1")
}

fn use_tool(tool: &str, intel: Value) -> String {
    json!({
        "thought": format!("calling {tool}"),
        "action": "use_tool",
        "tool_name": tool,
        "tool_args": {"command": "sessions -l", "question": "open ports on 10.0.0.5"},
        "target_intel": intel,
    })
    .to_string()
}

fn propose(to: &str) -> String {
    json!({
        "thought": "CVE-2021-41773 applies",
        "action": "transition_phase",
        "phase_transition": {
            "to_phase": to,
            "reason": "Apache 2.4.49 is vulnerable to CVE-2021-41773",
            "planned_actions": ["use exploit/multi/http/apache_normalize_path_rce"],
            "risks": ["service crash"]
        }
    })
    .to_string()
}

fn complete(summary: &str) -> String {
    json!({"thought": "done", "action": "complete", "completion_reason": summary}).to_string()
}

#[tokio::test]
async fn test_approved_transition_moves_to_exploitation() {
    let h = harness(10, vec![propose("exploitation"), complete("exploited 10.0.0.5")]);
    let key = key();

    let resp = h.orchestrator.submit(&key, "Exploit CVE-2021-41773 on 10.0.0.5").await.unwrap();
    assert!(resp.awaiting_approval);
    assert_eq!(resp.phase, Phase::Informational);
    assert!(resp.answer.contains("CVE-2021-41773"));
    let pending = resp.pending_transition.unwrap();
    assert_eq!(pending.from_phase, Phase::Informational);
    assert_eq!(pending.to_phase, Phase::Exploitation);

    let resp = h
        .orchestrator
        .resolve_approval(&key, ApprovalDecision::Approve, None)
        .await
        .unwrap();
    assert_eq!(resp.phase, Phase::Exploitation);
    assert!(!resp.awaiting_approval);
    assert!(resp.task_complete);
    assert_eq!(resp.answer, "exploited 10.0.0.5");

    let state = h.orchestrator.store().load(&key).await.unwrap().unwrap();
    let phases: Vec<Phase> = state.phase_history.iter().map(|e| e.phase).collect();
    assert_eq!(phases, vec![Phase::Informational, Phase::Exploitation]);
    assert!(state.phase_history[0].exited_at.is_some());
    assert!(state.check_invariants().is_ok());
}

#[tokio::test]
async fn test_console_denied_in_informational() {
    let h = harness(10, vec![use_tool("exploit_console", json!(null)), complete("stopped")]);
    let key = key();

    let resp = h.orchestrator.submit(&key, "Get a shell on 10.0.0.5").await.unwrap();
    assert_eq!(h.console_calls.load(Ordering::SeqCst), 0);
    assert_eq!(resp.phase, Phase::Informational);

    let state = h.orchestrator.store().load(&key).await.unwrap().unwrap();
    let first = &state.execution_trace.steps()[0];
    assert_eq!(first.tool_name.as_deref(), Some("exploit_console"));
    assert!(!first.success);
    assert!(first.error.as_deref().unwrap().contains("exploitation"));
    assert_eq!(first.phase, Phase::Informational);
}

#[tokio::test]
async fn test_submit_while_awaiting_is_rejected_without_change() {
    let h = harness(10, vec![propose("exploitation")]);
    let key = key();
    h.orchestrator.submit(&key, "Exploit 10.0.0.5").await.unwrap();
    let before = h.orchestrator.store().load(&key).await.unwrap().unwrap();

    let err = h.orchestrator.submit(&key, "what now?").await.unwrap_err();
    assert!(err.is_protocol_violation());
    assert!(matches!(
        err,
        OrchestratorError::AwaitingApproval {
            from: Phase::Informational,
            to: Phase::Exploitation
        }
    ));

    let after = h.orchestrator.store().load(&key).await.unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(h.llm.call_count(), 1);
}

#[tokio::test]
async fn test_resolve_without_pending_is_rejected() {
    let h = harness(10, vec![complete("nothing to do")]);
    let key = key();

    let err = h
        .orchestrator
        .resolve_approval(&key, ApprovalDecision::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NoPendingApproval));

    h.orchestrator.submit(&key, "scan 10.0.0.5").await.unwrap();
    let before = h.orchestrator.store().load(&key).await.unwrap().unwrap();
    let err = h
        .orchestrator
        .resolve_approval(&key, ApprovalDecision::Abort, None)
        .await
        .unwrap_err();
    assert!(err.is_protocol_violation());
    let after = h.orchestrator.store().load(&key).await.unwrap().unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_modify_resumes_in_original_phase() {
    let h = harness(
        10,
        vec![
            propose("exploitation"),
            use_tool("query_graph", json!(null)),
            complete("only recon done"),
        ],
    );
    let key = key();
    h.orchestrator.submit(&key, "Exploit 10.0.0.5").await.unwrap();

    let resp = h
        .orchestrator
        .resolve_approval(&key, ApprovalDecision::Modify, Some("enumerate port 8443 first"))
        .await
        .unwrap();
    assert_eq!(resp.phase, Phase::Informational);
    assert!(resp.task_complete);
    assert!(resp.pending_transition.is_none());
    assert_eq!(h.graph_calls.load(Ordering::SeqCst), 1);

    let second_prompt = h.llm.call(1).unwrap();
    assert!(second_prompt.iter().any(|m| m.content.contains("enumerate port 8443 first")));

    let state = h.orchestrator.store().load(&key).await.unwrap().unwrap();
    assert_eq!(state.phase_history.len(), 1);
}

#[tokio::test]
async fn test_abort_completes_task() {
    let h = harness(10, vec![propose("exploitation")]);
    let key = key();
    h.orchestrator.submit(&key, "Exploit 10.0.0.5").await.unwrap();

    let resp = h
        .orchestrator
        .resolve_approval(&key, ApprovalDecision::Abort, None)
        .await
        .unwrap();
    assert!(resp.task_complete);
    assert_eq!(resp.completion_reason.as_deref(), Some(ABORTED_BY_USER));
    assert_eq!(resp.phase, Phase::Informational);
    assert!(!resp.awaiting_approval);
    assert_eq!(h.llm.call_count(), 1);
}

#[tokio::test]
async fn test_budget_terminates_with_one_step_per_iteration() {
    let replies = (0..4).map(|_| use_tool("query_graph", json!(null))).collect();
    let h = harness(4, replies);
    let key = key();

    let resp = h.orchestrator.submit(&key, "map 10.0.0.0/24").await.unwrap();
    assert!(resp.task_complete);
    assert_eq!(resp.iteration, 4);
    assert!(resp.completion_reason.unwrap().contains("budget"));
    assert_eq!(resp.execution_trace_summary.len(), 4);
    assert_eq!(h.graph_calls.load(Ordering::SeqCst), 4);
    assert_eq!(h.llm.call_count(), 4);

    let state = h.orchestrator.store().load(&key).await.unwrap().unwrap();
    assert_eq!(state.execution_trace.len() as u32, state.iteration);
    assert!(state.check_invariants().is_ok());
}

#[tokio::test]
async fn test_target_intel_only_grows() {
    let h = harness(
        10,
        vec![
            use_tool("query_graph", json!({"primary_target": "10.0.0.5", "ports": [80]})),
            use_tool("query_graph", json!({"ports": [443], "technologies": ["Apache 2.4.49"]})),
            json!({"thought": "done", "action": "complete", "completion_reason": "mapped",
                   "target_intel": {"ports": [80]}})
            .to_string(),
        ],
    );
    let resp = h.orchestrator.submit(&key(), "map 10.0.0.5").await.unwrap();
    assert_eq!(resp.target_intel.ports, vec![80, 443]);
    assert_eq!(resp.target_intel.primary_target.as_deref(), Some("10.0.0.5"));
    assert_eq!(resp.target_intel.technologies, vec!["Apache 2.4.49".to_string()]);
}

#[tokio::test]
async fn test_pending_approval_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("sessions.db");
    let key = key();

    {
        let store = Arc::new(SqliteSessionStore::open(&db).unwrap());
        let h = harness_with(10, vec![propose("exploitation")], store);
        let resp = h.orchestrator.submit(&key, "Exploit 10.0.0.5").await.unwrap();
        assert!(resp.awaiting_approval);
    }

    let store = Arc::new(SqliteSessionStore::open(&db).unwrap());
    let h = harness_with(10, vec![complete("session 1 opened")], store);
    let snapshot = h.orchestrator.snapshot(&key).await.unwrap().unwrap();
    assert!(snapshot.awaiting_approval);

    let resp = h
        .orchestrator
        .resolve_approval(&key, ApprovalDecision::Approve, None)
        .await
        .unwrap();
    assert_eq!(resp.phase, Phase::Exploitation);
    assert!(resp.task_complete);
    assert_eq!(resp.iteration, 2);
}

#[tokio::test]
async fn test_reset_returns_fresh_key() {
    let h = harness(10, vec![complete("done")]);
    let key = key();
    h.orchestrator.submit(&key, "scan 10.0.0.5").await.unwrap();

    let fresh = h.orchestrator.reset(&key).await.unwrap();
    assert_ne!(fresh.session_id, key.session_id);
    assert_eq!(fresh.tenant_id, key.tenant_id);
    assert_eq!(fresh.project_id, key.project_id);
    assert!(h.orchestrator.store().load(&key).await.unwrap().is_none());
    assert!(h.orchestrator.snapshot(&fresh).await.unwrap().is_none());
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let orchestrator = OrchestratorBuilder::new(AppConfig::default())
        .with_llm(Arc::new(MockLlmClient))
        .with_store(Arc::new(MemorySessionStore::new()))
        .without_default_tools()
        .build()
        .unwrap();
    let a = SessionKey::new("tenant-a", "project-1", "s1");
    let b = SessionKey::new("tenant-b", "project-1", "s1");

    let (ra, rb) = tokio::join!(orchestrator.submit(&a, "scan host a"), orchestrator.submit(&b, "scan host b"));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.tenant_id, "tenant-a");
    assert_eq!(rb.tenant_id, "tenant-b");
    assert_eq!(orchestrator.session_count().await.unwrap(), 2);
    assert_eq!(
        orchestrator.list_sessions("tenant-a", "project-1").await.unwrap(),
        vec!["s1".to_string()]
    );
}

#[tokio::test]
async fn test_empty_question_is_invalid() {
    let h = harness(10, vec![]);
    let err = h.orchestrator.submit(&key(), "   ").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
    assert_eq!(h.llm.call_count(), 0);
}
