//! MCP server exposing the `get-xhs-post` tool over stdio.

use std::sync::Arc;

use rmcp::{
    handler::server::tool::schema_for_type,
    model::{
        CallToolRequestParams, CallToolResult, Content, Implementation, ListToolsResult,
        PaginatedRequestParams, ServerCapabilities, ServerInfo, Tool,
    },
    service::{RequestContext, RoleServer},
    ErrorData as McpError, ServerHandler, ServiceExt,
};
use serde_json::Value;
use tokio::io::{stdin, stdout};

use crate::models::{ContentBlock, GetXhsPostParams};
use crate::pipeline::PostExtractor;

pub const GET_POST_TOOL: &str = "get-xhs-post";
const GET_POST_DESCRIPTION: &str =
    "Get post content, images, and download videos from Xiaohongshu (Xiaohongshu/小红书) by share link";

#[derive(Clone)]
pub struct XhsMcpServer {
    extractor: Arc<PostExtractor>,
}

impl XhsMcpServer {
    pub fn new(extractor: Arc<PostExtractor>) -> Self {
        Self { extractor }
    }

    /// Serve requests on stdin/stdout until the client disconnects.
    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!("starting xhs MCP server");
        let server = self.serve((stdin(), stdout())).await?;
        tracing::info!("MCP server initialized, waiting for requests");
        server.waiting().await?;
        Ok(())
    }

    async fn handle_get_post(&self, params: GetXhsPostParams) -> Vec<Content> {
        self.extractor
            .get_post(&params.share_link)
            .await
            .into_iter()
            .map(into_content)
            .collect()
    }
}

fn tool_definitions() -> Vec<Tool> {
    vec![Tool::new(
        GET_POST_TOOL,
        GET_POST_DESCRIPTION,
        schema_for_type::<GetXhsPostParams>(),
    )]
}

fn into_content(block: ContentBlock) -> Content {
    match block {
        ContentBlock::Text { text } => Content::text(text),
        ContentBlock::Image { data, mime_type } => Content::image(data, mime_type),
    }
}

impl ServerHandler for XhsMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "xhs-post-extractor".to_string(),
                title: Some("Xiaohongshu Post Extractor".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Pass a Xiaohongshu share link (or the whole share text) to get-xhs-post. \
                Returns the title, description, image download status and saved video paths."
                    .to_string(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            meta: None,
            tools: tool_definitions(),
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        match request.name.as_ref() {
            GET_POST_TOOL => {
                let params: GetXhsPostParams =
                    serde_json::from_value(Value::Object(request.arguments.unwrap_or_default()))
                        .map_err(|e| {
                            McpError::invalid_params(format!("Invalid parameters: {}", e), None)
                        })?;
                Ok(CallToolResult::success(self.handle_get_post(params).await))
            }
            other => Err(McpError::invalid_params(
                format!("Unknown tool: {}", other),
                None,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractorConfig;
    use crate::testing::{FakeLauncher, PageScript};

    fn server(dir: &std::path::Path, launcher: Arc<FakeLauncher>) -> XhsMcpServer {
        let extractor = PostExtractor::new(ExtractorConfig::new(dir), launcher).unwrap();
        XhsMcpServer::new(Arc::new(extractor))
    }

    #[test]
    fn get_info_advertises_tools() {
        let dir = tempfile::tempdir().unwrap();
        let info = server(dir.path(), Arc::new(FakeLauncher::new(PageScript::default()))).get_info();

        assert_eq!(info.server_info.name, "xhs-post-extractor");
        assert!(info.capabilities.tools.is_some());
    }

    #[test]
    fn single_tool_takes_share_link() {
        let tools = tool_definitions();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, GET_POST_TOOL);

        let schema = serde_json::to_value(tools[0].input_schema.as_ref()).unwrap();
        assert!(schema["properties"].get("shareLink").is_some(), "{}", schema);
        assert_eq!(schema["required"], serde_json::json!(["shareLink"]));
    }

    #[test]
    fn params_use_camel_case_key() {
        let params: GetXhsPostParams =
            serde_json::from_value(serde_json::json!({"shareLink": "http://xhslink.com/a"})).unwrap();
        assert_eq!(params.share_link, "http://xhslink.com/a");
        assert!(serde_json::from_value::<GetXhsPostParams>(serde_json::json!({"share_link": "x"})).is_err());
    }

    #[tokio::test]
    async fn invalid_link_is_plain_text_content() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher::new(PageScript::default()));
        let contents = server(dir.path(), launcher.clone())
            .handle_get_post(GetXhsPostParams {
                share_link: "没有链接".into(),
            })
            .await;

        assert_eq!(contents.len(), 1);
        assert_eq!(
            contents[0].as_text().map(|t| t.text.as_str()),
            Some("Invalid Xiaohongshu share link")
        );
        assert_eq!(launcher.launches(), 0);
    }

    #[test]
    fn image_blocks_keep_mime_type() {
        let content = into_content(ContentBlock::Image {
            data: "AAAA".into(),
            mime_type: "image/png".into(),
        });
        let image = content.as_image().unwrap();
        assert_eq!(image.data, "AAAA");
        assert_eq!(image.mime_type, "image/png");
    }
}
