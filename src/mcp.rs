//! MCP server implementation using rmcp.
//!
//! Exposes code execution, follow-up input and cancellation as MCP tools.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{error, info};

use crate::backend::{ExecutionBackend, ExecutionRequest, ExecutionResult};
use crate::error::ExecError;
use crate::language::Language;

/// MCP server for sandboxed code execution.
#[derive(Clone)]
pub struct SandboxServer {
    backend: Arc<dyn ExecutionBackend>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the execute tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    #[schemars(description = "Language identifier: javascript, python, java, cpp, csharp or rust")]
    pub language: String,

    #[schemars(description = "The source code to run")]
    pub code: String,

    #[schemars(description = "Optional stdin, delivered one line at a time")]
    #[serde(default)]
    pub stdin: Option<String>,

    #[schemars(description = "Keep the program alive for send_input when it asks for input")]
    #[serde(default)]
    pub interactive: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SendInputParams {
    #[schemars(description = "Execution id returned by execute")]
    pub execution_id: String,

    #[schemars(description = "One line of input")]
    pub input: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StopParams {
    #[schemars(description = "Execution id returned by execute")]
    pub execution_id: String,
}

/// Combine a result into the text shown to the client.
fn render(result: &ExecutionResult) -> String {
    let mut output = if result.stderr.is_empty() {
        result.stdout.clone()
    } else if result.stdout.is_empty() {
        result.stderr.clone()
    } else {
        format!("{}\n--- stderr ---\n{}", result.stdout, result.stderr)
    };

    if result.is_waiting_for_input {
        let prompt = result.waiting_prompt.as_deref().unwrap_or("");
        match &result.execution_id {
            Some(id) => output.push_str(&format!(
                "\n--- waiting for input: {prompt} (execution {id}, use send_input) ---"
            )),
            None => output.push_str(&format!("\n--- waiting for input: {prompt} ---")),
        }
    }
    output
}

fn to_tool_result(result: &ExecutionResult) -> CallToolResult {
    let text = render(result);
    if result.succeeded() || result.is_waiting_for_input {
        CallToolResult::success(vec![Content::text(text)])
    } else {
        CallToolResult::error(vec![Content::text(text)])
    }
}

fn from_exec_error(e: &ExecError) -> Result<CallToolResult, McpError> {
    match e {
        ExecError::UnsupportedLanguage(_) | ExecError::SessionNotFound(_) => {
            Err(McpError::invalid_params(e.to_string(), None))
        }
        _ => {
            error!(kind = e.kind(), detail = ?e.detail(), "Execution failed");
            Ok(CallToolResult::error(vec![Content::text(format!(
                "Execution error: {e}"
            ))]))
        }
    }
}

#[tool_router]
impl SandboxServer {
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            backend,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Run code in an isolated container and return its output")]
    async fn execute(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(language = %params.language, code_len = params.code.len(), "Executing code");
        let request = ExecutionRequest {
            code: params.code,
            language: params.language,
            stdin: params.stdin,
            interactive: params.interactive,
        };
        match self.backend.execute(request).await {
            Ok(result) => Ok(to_tool_result(&result)),
            Err(e) => from_exec_error(&e),
        }
    }

    #[tool(description = "Send one line of input to an execution waiting for input")]
    async fn send_input(
        &self,
        Parameters(params): Parameters<SendInputParams>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .backend
            .send_input(&params.execution_id, &params.input)
            .await
        {
            Ok(result) => Ok(to_tool_result(&result)),
            Err(e) => from_exec_error(&e),
        }
    }

    #[tool(description = "Stop a running execution")]
    async fn stop_execution(
        &self,
        Parameters(params): Parameters<StopParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.backend.stop(&params.execution_id).await {
            Ok(result) => Ok(CallToolResult::success(vec![Content::text(render(&result))])),
            Err(e) => from_exec_error(&e),
        }
    }

    #[tool(description = "List supported languages and whether they can run right now")]
    async fn list_languages(&self) -> Result<CallToolResult, McpError> {
        let lines: Vec<String> = self
            .backend
            .languages()
            .await
            .into_iter()
            .map(|l| format!("{} ({}): {:?}", l.id, l.name, l.mode).to_lowercase())
            .collect();
        Ok(CallToolResult::success(vec![Content::text(lines.join("\n"))]))
    }
}

#[tool_handler]
impl ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        let languages: Vec<_> = Language::ALL.iter().map(|l| l.id()).collect();

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "code-sandbox-daemon".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Run untrusted code in per-execution containers.\n\
                 Languages: {languages:?}\n\
                 \n\
                 Use 'execute' with language and code (optionally stdin).\n\
                 With interactive=true, a program that asks for input stays alive:\n\
                 answer with 'send_input' or end it with 'stop_execution'."
            )),
        }
    }
}

/// Serve the sandbox server over stdio.
pub async fn serve_stdio(backend: Arc<dyn ExecutionBackend>) -> anyhow::Result<()> {
    let server = SandboxServer::new(backend);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}
