// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wrapping of external tool-server tools into local [`ToolInstance`]s.
//!
//! The transport sits at the seam between the runtime and whatever wire
//! protocol the tool server speaks; the runtime only lists and invokes.
//! Each wrapped tool carries a namespaced name
//! (`<prefix>__<server>__<tool>`) so remote tools can never shadow local
//! ones, and its descriptor records `source = remote` with the server and
//! transport identity.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    context::ToolContext,
    descriptor::{ToolDescriptor, ToolSource},
    outcome::ToolOutcome,
    ToolInstance,
};

/// A tool as advertised by the remote server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    /// Whether invoking this tool mutates external state.  Servers that do
    /// not report this default to `true` — the conservative reading.
    #[serde(default = "default_mutates")]
    pub mutates: bool,
}

fn default_mutates() -> bool {
    true
}

/// Transport to one external tool server.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Transport identity recorded in descriptors (e.g. "stdio", "http").
    fn kind(&self) -> &str;

    async fn list_tools(&self) -> anyhow::Result<Vec<RemoteToolSpec>>;

    async fn invoke(&self, tool: &str, args: Value) -> anyhow::Result<Value>;
}

/// A remote tool wrapped as a local [`ToolInstance`].
pub struct RemoteTool {
    descriptor: ToolDescriptor,
    /// Name on the remote side, without the local namespace prefix.
    remote_name: String,
    transport: Arc<dyn RemoteTransport>,
}

#[async_trait]
impl ToolInstance for RemoteTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn exec(&self, args: Value, _ctx: &ToolContext) -> anyhow::Result<ToolOutcome> {
        debug!(tool = %self.descriptor.name, remote = %self.remote_name, "invoking remote tool");
        match self.transport.invoke(&self.remote_name, args).await {
            Ok(value) => Ok(ToolOutcome::ok(value)),
            Err(e) => Ok(ToolOutcome::err(format!("remote tool failed: {e}"))),
        }
    }
}

/// List a server's tools and wrap each into a namespaced local instance.
pub async fn wrap_remote_server(
    prefix: &str,
    server: &str,
    transport: Arc<dyn RemoteTransport>,
) -> anyhow::Result<Vec<Arc<dyn ToolInstance>>> {
    let specs = transport.list_tools().await?;
    let mut tools: Vec<Arc<dyn ToolInstance>> = Vec::with_capacity(specs.len());
    for spec in specs {
        let local_name = format!("{prefix}__{server}__{}", spec.name);
        let descriptor = ToolDescriptor {
            name: local_name,
            description: spec.description,
            parameters: spec.parameters,
            source: ToolSource::Remote {
                server: server.to_string(),
                transport: transport.kind().to_string(),
            },
            mutates: spec.mutates,
            concurrent: false,
            planning: false,
            timeout_ms: None,
        };
        tools.push(Arc::new(RemoteTool {
            descriptor,
            remote_name: spec.name,
            transport: Arc::clone(&transport),
        }));
    }
    Ok(tools)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::context::NoopHost;

    struct FakeTransport;

    #[async_trait]
    impl RemoteTransport for FakeTransport {
        fn kind(&self) -> &str {
            "stdio"
        }

        async fn list_tools(&self) -> anyhow::Result<Vec<RemoteToolSpec>> {
            Ok(vec![
                RemoteToolSpec {
                    name: "search".into(),
                    description: "full-text search".into(),
                    parameters: json!({"type": "object"}),
                    mutates: false,
                },
                RemoteToolSpec {
                    name: "ingest".into(),
                    description: "ingest a document".into(),
                    parameters: json!({"type": "object"}),
                    mutates: true,
                },
            ])
        }

        async fn invoke(&self, tool: &str, args: Value) -> anyhow::Result<Value> {
            if tool == "search" {
                Ok(json!({"hits": args["q"]}))
            } else {
                anyhow::bail!("server exploded")
            }
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new(Arc::new(NoopHost), None, "c1")
    }

    #[tokio::test]
    async fn wrapped_names_carry_namespace_prefix() {
        let tools = wrap_remote_server("ext", "docs", Arc::new(FakeTransport))
            .await
            .unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.descriptor().name.as_str()).collect();
        assert!(names.contains(&"ext__docs__search"));
        assert!(names.contains(&"ext__docs__ingest"));
    }

    #[tokio::test]
    async fn descriptor_records_remote_source() {
        let tools = wrap_remote_server("ext", "docs", Arc::new(FakeTransport))
            .await
            .unwrap();
        let search = tools
            .iter()
            .find(|t| t.descriptor().name.ends_with("__search"))
            .unwrap();
        assert_eq!(
            search.descriptor().source,
            ToolSource::Remote {
                server: "docs".into(),
                transport: "stdio".into()
            }
        );
        assert!(!search.descriptor().mutates);
    }

    #[tokio::test]
    async fn invoke_maps_into_outcome() {
        let tools = wrap_remote_server("ext", "docs", Arc::new(FakeTransport))
            .await
            .unwrap();
        let search = tools
            .iter()
            .find(|t| t.descriptor().name.ends_with("__search"))
            .unwrap();
        let out = search.exec(json!({"q": "agent"}), &ctx()).await.unwrap();
        assert!(!out.is_error);
        assert_eq!(out.value["data"]["hits"], "agent");
    }

    #[tokio::test]
    async fn transport_failure_becomes_error_outcome() {
        let tools = wrap_remote_server("ext", "docs", Arc::new(FakeTransport))
            .await
            .unwrap();
        let ingest = tools
            .iter()
            .find(|t| t.descriptor().name.ends_with("__ingest"))
            .unwrap();
        let out = ingest.exec(json!({}), &ctx()).await.unwrap();
        assert!(out.is_error);
        assert!(out.value["error"].as_str().unwrap().contains("server exploded"));
    }
}
