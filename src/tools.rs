//! Tool catalog and invocation
//!
//! Thin typed layer over `tools/list` and `tools/call`. Arguments and results
//! are passed through untouched.

use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::bridge::ProcessBridge;
use crate::protocol::{methods, ToolCallParams, ToolInfo, ToolListPage, ToolListParams};
use crate::utils::validate_name;
use crate::{Error, Result};

/// Upper bound on `tools/list` pages followed in one listing
const MAX_LIST_PAGES: usize = 64;

impl ProcessBridge {
    /// Raw result of `tools/list`
    pub async fn list_available(&self) -> Result<JsonValue> {
        self.call(methods::TOOLS_LIST, None).await
    }

    /// Every tool the server offers, following `nextCursor` until exhausted.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let mut tools = Vec::new();
        let mut cursor = None;

        for _ in 0..MAX_LIST_PAGES {
            let page: ToolListPage = self
                .request(methods::TOOLS_LIST, ToolListParams { cursor })
                .await?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(
            pages = MAX_LIST_PAGES,
            tools = tools.len(),
            "Tool listing still paginating, giving up"
        );
        Err(Error::Transport(format!(
            "tools/list returned a cursor after {} pages",
            MAX_LIST_PAGES
        )))
    }

    /// Invoke a named tool with already-validated arguments.
    pub async fn call_tool(&self, name: &str, arguments: JsonValue) -> Result<JsonValue> {
        let params = tool_call_params(name, arguments)?;
        self.call(methods::TOOLS_CALL, Some(params)).await
    }

    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: JsonValue,
        timeout: Duration,
    ) -> Result<JsonValue> {
        let params = tool_call_params(name, arguments)?;
        self.call_with_timeout(methods::TOOLS_CALL, Some(params), timeout)
            .await
    }
}

fn tool_call_params(name: &str, arguments: JsonValue) -> Result<JsonValue> {
    validate_name("tool", name)?;
    let arguments = match arguments {
        JsonValue::Null => JsonValue::Object(Default::default()),
        other => other,
    };
    Ok(serde_json::to_value(ToolCallParams { name, arguments })?)
}
