//! 端口扫描适配器（port_scan）
//!
//! 以子进程运行 naabu（-silent），输出每行一个 `host:port`；据此提取目标与开放端口情报。

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::config::PortScanSection;
use crate::core::{TargetIntel, TargetType};
use crate::tools::{Tool, ToolContext};

pub struct PortScanTool {
    binary: String,
}

impl PortScanTool {
    pub fn new(section: &PortScanSection) -> Self {
        Self {
            binary: section.binary.clone(),
        }
    }

    fn build_args(args: &Value) -> Result<Vec<String>, String> {
        let target = args
            .get("target")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or("missing required argument: target")?;
        if !is_safe_arg(target) {
            return Err(format!("invalid target: {target}"));
        }
        let mut argv = vec!["-host".to_string(), target.to_string(), "-silent".to_string()];
        if let Some(ports) = args.get("ports").and_then(|v| v.as_str()) {
            if !ports.chars().all(|c| c.is_ascii_digit() || c == ',' || c == '-') {
                return Err(format!("invalid ports: {ports}"));
            }
            argv.push("-p".into());
            argv.push(ports.to_string());
        } else if let Some(top) = args.get("top_ports").and_then(|v| v.as_u64()) {
            argv.push("-top-ports".into());
            argv.push(top.to_string());
        }
        Ok(argv)
    }
}

/// 目标只允许主机名 / IP / CIDR 字符，且不能被解析为选项
fn is_safe_arg(s: &str) -> bool {
    !s.starts_with('-')
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '/' | ',' | '[' | ']'))
}

/// 解析 `host:port` 行（IPv6 以最后一个冒号分隔）
fn parse_line(line: &str) -> Option<(&str, u16)> {
    let (host, port) = line.trim().rsplit_once(':')?;
    Some((host, port.parse().ok()?))
}

#[async_trait]
impl Tool for PortScanTool {
    fn name(&self) -> &str {
        "port_scan"
    }

    fn description(&self) -> &str {
        "Scan a host for open TCP ports (naabu). Use to verify or refresh port data; the graph already holds recon results."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "target": { "type": "string", "description": "Host, IP or CIDR" },
                "ports": { "type": "string", "description": "Port list/ranges, e.g. 22,80,8000-8100" },
                "top_ports": { "type": "integer", "description": "Scan the N most common ports" }
            },
            "required": ["target"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String> {
        let argv = Self::build_args(&args)?;
        tracing::info!(session = %ctx.key, binary = %self.binary, args = ?argv, "port scan");

        let output = Command::new(&self.binary)
            .args(&argv)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {e}", self.binary))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(format!("Exit {:?}\nstderr: {}", output.status.code(), stderr.trim()));
        }
        if stdout.trim().is_empty() {
            return Ok("No open ports found".to_string());
        }
        Ok(stdout.trim().to_string())
    }

    fn extract_intel(&self, output: &str) -> Option<TargetIntel> {
        let mut intel = TargetIntel::default();
        for (host, port) in output.lines().filter_map(parse_line) {
            if intel.primary_target.is_none() {
                intel.primary_target = Some(host.to_string());
                intel.target_type = Some(TargetType::of_host(host));
            }
            if !intel.ports.contains(&port) {
                intel.ports.push(port);
            }
        }
        (!intel.is_empty()).then_some(intel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_args() {
        let argv = PortScanTool::build_args(&json!({"target": "10.0.0.5", "ports": "22,80,443"})).unwrap();
        assert_eq!(argv, vec!["-host", "10.0.0.5", "-silent", "-p", "22,80,443"]);
    }

    #[test]
    fn test_rejects_option_injection() {
        assert!(PortScanTool::build_args(&json!({"target": "-o /etc/passwd"})).is_err());
        assert!(PortScanTool::build_args(&json!({"target": "10.0.0.5", "ports": "80; id"})).is_err());
        assert!(PortScanTool::build_args(&json!({})).is_err());
    }

    #[test]
    fn test_extract_intel() {
        let tool = PortScanTool::new(&PortScanSection::default());
        let intel = tool
            .extract_intel("10.0.0.5:22\n10.0.0.5:443\nnoise line\n10.0.0.5:22\n")
            .unwrap();
        assert_eq!(intel.primary_target.as_deref(), Some("10.0.0.5"));
        assert_eq!(intel.target_type, Some(TargetType::Ip));
        assert_eq!(intel.ports, vec![22, 443]);
        assert!(tool.extract_intel("No open ports found").is_none());
    }

    #[tokio::test]
    async fn test_missing_binary_is_error() {
        let tool = PortScanTool::new(&PortScanSection {
            binary: "definitely-not-a-real-scanner-binary".into(),
        });
        let ctx = ToolContext::new(crate::session::SessionKey::new("u", "p", "s"));
        let err = tool.execute(json!({"target": "127.0.0.1"}), &ctx).await.unwrap_err();
        assert!(err.contains("failed to run"));
    }
}
