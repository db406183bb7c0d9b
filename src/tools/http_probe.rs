//! HTTP 探测适配器（http_request）
//!
//! 对目标发送单个 HTTP 请求，输出状态行、响应头与正文；调用之间无状态。
//! 从 Server / X-Powered-By 头中提取技术栈情报。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;

use crate::config::HttpSection;
use crate::core::{TargetIntel, TargetType};
use crate::tools::{Tool, ToolContext};

/// 提取技术栈的响应头
const TECH_HEADERS: &[&str] = &["server", "x-powered-by", "x-aspnet-version", "x-generator"];

pub struct HttpProbeTool {
    client: Client,
}

impl HttpProbeTool {
    pub fn new(section: &HttpSection) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_secs(section.timeout_secs))
            .danger_accept_invalid_certs(section.accept_invalid_certs)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| format!("http client: {e}"))?;
        Ok(Self { client })
    }
}

/// 输出首行格式：`HTTP <status> <url>`
fn render_response(status: u16, url: &str, headers: &[(String, String)], body: &str) -> String {
    let mut out = format!("HTTP {status} {url}\n");
    for (k, v) in headers {
        out.push_str(&format!("{k}: {v}\n"));
    }
    out.push('\n');
    out.push_str(body);
    out
}

#[async_trait]
impl Tool for HttpProbeTool {
    fn name(&self) -> &str {
        "http_request"
    }

    fn description(&self) -> &str {
        "Send one HTTP request to a target to verify a service, banner or endpoint. Returns status line, headers and body."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "Full URL, e.g. http://10.0.0.5:8080/" },
                "method": { "type": "string", "description": "HTTP method, default GET" },
                "headers": { "type": "object", "description": "Extra request headers" },
                "body": { "type": "string", "description": "Request body" }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String, String> {
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
            .ok_or("missing or invalid argument: url (http:// or https://)")?;
        let method = args
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();
        let method = Method::from_bytes(method.as_bytes()).map_err(|e| format!("invalid method: {e}"))?;

        let mut req = self.client.request(method, url);
        if let Some(headers) = args.get("headers").and_then(|v| v.as_object()) {
            for (k, v) in headers {
                if let Some(v) = v.as_str() {
                    req = req.header(k.as_str(), v);
                }
            }
        }
        if let Some(body) = args.get("body").and_then(|v| v.as_str()) {
            req = req.body(body.to_string());
        }

        tracing::debug!(session = %ctx.key, url = %url, "http probe");
        let resp = req.send().await.map_err(|e| format!("request failed: {e}"))?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).to_string()))
            .collect();
        let body = resp.text().await.map_err(|e| format!("read body failed: {e}"))?;
        Ok(render_response(status, &final_url, &headers, &body))
    }

    fn extract_intel(&self, output: &str) -> Option<TargetIntel> {
        let mut lines = output.lines();
        let url = lines.next()?.split_whitespace().nth(2)?;
        let parsed = reqwest::Url::parse(url).ok()?;
        let host = parsed.host_str()?.to_string();

        let mut intel = TargetIntel {
            target_type: Some(TargetType::of_host(&host)),
            primary_target: Some(host),
            ..Default::default()
        };
        if let Some(port) = parsed.port_or_known_default() {
            intel.ports.push(port);
            intel.services.push(format!("{port}/{}", parsed.scheme()));
        }
        for line in lines.take_while(|l| !l.is_empty()) {
            if let Some((k, v)) = line.split_once(':') {
                if TECH_HEADERS.contains(&k.trim().to_lowercase().as_str()) && !v.trim().is_empty() {
                    intel.technologies.push(v.trim().to_string());
                }
            }
        }
        Some(intel)
    }
}
