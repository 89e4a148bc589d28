use rmcp::{model::*, ServiceExt};
use std::sync::Arc;
use tracing::{error, info};

use crate::{AppState, EventSink, ResearchError, ResearchRequest, Settings};

#[derive(Clone)]
pub struct McpService {
    pub state: Arc<AppState>,
}

impl McpService {
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        info!("Starting Deep Research MCP service");
        info!(
            "LLM provider: {:?}, search provider: {:?}, extractor: {:?}",
            settings.llm.provider, settings.search.provider, settings.extractor.kind
        );

        let http_client = crate::providers::build_http_client()?;

        Ok(Self {
            state: Arc::new(AppState::new(settings, http_client)),
        })
    }

    pub fn from_state(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }
}

/// Input schema of the `deep_research` tool, derived from the request type.
pub fn research_tool() -> Tool {
    let schema = match serde_json::to_value(schemars::schema_for!(ResearchRequest)) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    Tool::new(
        "deep_research",
        "Research a question in depth: generates search queries, reads and filters the pages found over several rounds, and writes a report from the relevant sources.",
        Arc::new(schema),
    )
}

/// Tool output: the report, then the process log.
pub fn render_tool_output(report: &str, logs: &[String]) -> String {
    format!("{}\n\n---\n\n**Process log:**\n{}", report, logs.join("\n"))
}

impl rmcp::ServerHandler for McpService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            server_info: Implementation {
                name: "deep-research".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Iterative web research: call deep_research with a question to receive a sourced report.".to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _page: Option<PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        Ok(ListToolsResult {
            tools: vec![research_tool()],
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        info!("MCP tool call: {} with args: {:?}", request.name, request.arguments);

        if request.name.as_ref() != "deep_research" {
            return Err(ErrorData::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("Unknown tool: {}", request.name),
                None,
            ));
        }

        let args = request.arguments.ok_or_else(|| {
            ErrorData::new(ErrorCode::INVALID_PARAMS, "Missing required arguments object", None)
        })?;
        let research: ResearchRequest = serde_json::from_value(serde_json::Value::Object(args))
            .map_err(|e| ErrorData::new(ErrorCode::INVALID_PARAMS, e.to_string(), None))?;
        research
            .validate()
            .map_err(|e| ErrorData::new(ErrorCode::INVALID_PARAMS, e, None))?;

        let engine = self.state.engine().map_err(|e| {
            error!("Provider configuration error: {}", e);
            ErrorData::new(ErrorCode::INTERNAL_ERROR, e.to_string(), None)
        })?;
        let events = EventSink::new();
        // The peer cancelling the request cancels the session.
        match self
            .state
            .run_session(&engine, &research, &events, &context.ct)
            .await
        {
            Ok(report) => Ok(CallToolResult::success(vec![Content::text(
                render_tool_output(&report.body, &report.logs()),
            )])),
            Err(ResearchError::Cancelled) => Ok(CallToolResult::error(vec![Content::text(
                "Research cancelled",
            )])),
            Err(e) => {
                error!("Research tool error: {}", e);
                Ok(CallToolResult::error(vec![Content::text(
                    render_tool_output(&format!("Research failed: {}", e), &events.log_lines()),
                )]))
            }
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    let service = McpService::new(settings)?;
    // Use the stdio transport from rmcp
    let server = service.serve(rmcp::transport::stdio()).await?;
    info!("MCP stdio server running");
    let _quit_reason = server.waiting().await?;
    Ok(())
}
