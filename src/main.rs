//! RedAgent 交互式终端
//!
//! 入口：初始化日志、加载配置、组装编排器，然后逐行读取 stdin。
//! 普通输入作为问题提交；以 / 开头的是命令（/approve、/modify、/abort、/reset、/state、/sessions、/quit）。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use redagent::config::load_config;
use redagent::core::{ApprovalDecision, Orchestrator, OrchestratorBuilder, Response};
use redagent::observability;
use redagent::react::ReactEvent;
use redagent::session::SessionKey;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

const HELP: &str = "\
commands:
  <question>        submit a question / objective
  /approve          approve the pending phase transition
  /modify <text>    reject the transition and give new guidance
  /abort            abort the task
  /reset            drop this session and start a new one
  /state            show the current session snapshot
  /sessions         list sessions for this tenant/project
  /quit             exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(std::env::args().nth(1).map(PathBuf::from)).context("Failed to load config")?;
    let (tx, rx) = mpsc::unbounded_channel();
    let mut key = SessionKey::fresh(cfg.app.tenant_id.clone(), cfg.app.project_id.clone());
    let orchestrator = Arc::new(
        OrchestratorBuilder::new(cfg)
            .build()
            .context("Failed to build orchestrator")?
            .with_events(tx),
    );

    tokio::spawn(print_events(rx));

    println!("redagent session {key}");
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt().await;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (cmd, rest) = match line.split_once(char::is_whitespace) {
            Some((c, r)) => (c, r.trim()),
            None => (line, ""),
        };
        match cmd {
            "/quit" | "/exit" => break,
            "/help" => println!("{HELP}"),
            "/approve" => resolve(&orchestrator, &key, ApprovalDecision::Approve, None).await,
            "/modify" => {
                if rest.is_empty() {
                    println!("usage: /modify <guidance>");
                } else {
                    resolve(&orchestrator, &key, ApprovalDecision::Modify, Some(rest)).await
                }
            }
            "/abort" => resolve(&orchestrator, &key, ApprovalDecision::Abort, None).await,
            "/reset" => match orchestrator.reset(&key).await {
                Ok(fresh) => {
                    key = fresh;
                    println!("new session {key}");
                }
                Err(e) => println!("error: {e}"),
            },
            "/state" => match orchestrator.snapshot(&key).await {
                Ok(Some(resp)) => print_response(&resp),
                Ok(None) => println!("(no state yet)"),
                Err(e) => println!("error: {e}"),
            },
            "/sessions" => match orchestrator.list_sessions(&key.tenant_id, &key.project_id).await {
                Ok(ids) => {
                    for id in ids {
                        let marker = if id == key.session_id { "*" } else { " " };
                        println!("{marker} {id}");
                    }
                }
                Err(e) => println!("error: {e}"),
            },
            c if c.starts_with('/') => println!("unknown command {c}\n{HELP}"),
            _ => match orchestrator.submit(&key, line).await {
                Ok(resp) => print_response(&resp),
                Err(e) => println!("error: {e}"),
            },
        }
    }
    Ok(())
}

async fn prompt() {
    let mut out = tokio::io::stdout();
    let _ = out.write_all(b"> ").await;
    let _ = out.flush().await;
}

async fn resolve(orchestrator: &Orchestrator, key: &SessionKey, decision: ApprovalDecision, text: Option<&str>) {
    match orchestrator.resolve_approval(key, decision, text).await {
        Ok(resp) => print_response(&resp),
        Err(e) => println!("error: {e}"),
    }
}

fn print_response(resp: &Response) {
    println!();
    if !resp.answer.is_empty() {
        println!("{}", resp.answer);
    }
    if let Some(err) = &resp.error {
        println!("error: {err}");
    }
    println!(
        "[phase {} | iteration {}/{} | complete {}]",
        resp.phase, resp.iteration, resp.max_iterations, resp.task_complete
    );
    if resp.awaiting_approval {
        println!("awaiting approval: /approve, /modify <text> or /abort");
    }
}

fn preview(s: &str, max: usize) -> String {
    let s = s.trim();
    match s.char_indices().nth(max) {
        Some((i, _)) => format!("{}...", &s[..i]),
        None => s.to_string(),
    }
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<ReactEvent>) {
    while let Some(ev) = rx.recv().await {
        match ev {
            ReactEvent::StepUpdate {
                iteration,
                max_iterations,
                phase,
            } => println!("-- iteration {iteration}/{max_iterations} [{phase}]"),
            ReactEvent::Thinking => {}
            ReactEvent::ThinkingContent { text } => println!("   thought: {}", preview(&text, 200)),
            ReactEvent::ToolCall { tool, args } => println!("   tool: {tool} {args}"),
            ReactEvent::Observation { tool, success, preview: p } => {
                let mark = if success { "ok" } else { "failed" };
                println!("   {tool} {mark}: {}", preview(&p, 200));
            }
            ReactEvent::PolicyDenied { tool, reason } => println!("   denied {tool}: {reason}"),
            ReactEvent::PhaseChanged { from, to } => println!("   phase {from} -> {to}"),
            ReactEvent::ApprovalRequested { from, to, reason } => {
                println!("   approval requested {from} -> {to}: {reason}")
            }
            ReactEvent::Recovery { action, detail } => println!("   recovery {action}: {detail}"),
            ReactEvent::Completed { summary } => println!("   completed: {}", preview(&summary, 200)),
            ReactEvent::Error { text } => println!("   error: {text}"),
        }
    }
}
