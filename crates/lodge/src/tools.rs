//! Typed entry points for the operations workers implement.
//!
//! Every call carries a [`ToolContext`] naming the identity it acts for.
//! Nothing here keeps per-caller state; the transport builds a context for
//! each call and passes it down.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use lodge_protocol::methods;

use crate::supervisor::{SupervisorResult, WorkerSupervisor};

/// Per-call context supplied by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ToolContext {
    /// Trusted external identity, e.g. an email address.
    pub external_id: String,
}

impl ToolContext {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
        }
    }
}

/// Forwarders for terminal, workspace and file operations.
///
/// Results are returned as the worker produced them.
#[derive(Clone)]
pub struct WorkspaceTools {
    supervisor: WorkerSupervisor,
}

impl WorkspaceTools {
    pub fn new(supervisor: WorkerSupervisor) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }

    pub async fn ping(&self, ctx: &ToolContext) -> SupervisorResult<Value> {
        self.supervisor.call(ctx, methods::PING, json!({})).await
    }

    /// Run `command` through the account's shell and collect its output.
    pub async fn execute_command(
        &self,
        ctx: &ToolContext,
        command: &str,
        cwd: Option<&str>,
        timeout_secs: Option<u64>,
    ) -> SupervisorResult<Value> {
        let mut params = Map::new();
        params.insert("command".into(), json!(command));
        insert_opt(&mut params, "cwd", cwd);
        insert_opt(&mut params, "timeout_secs", timeout_secs);
        self.forward(ctx, methods::EXECUTE_COMMAND, params).await
    }

    /// Write to a terminal, creating one when `terminal_id` is `None`.
    pub async fn write_terminal(
        &self,
        ctx: &ToolContext,
        terminal_id: Option<&str>,
        input: &str,
    ) -> SupervisorResult<Value> {
        let mut params = Map::new();
        insert_opt(&mut params, "terminal_id", terminal_id);
        params.insert("input".into(), json!(input));
        self.forward(ctx, methods::WRITE_TERMINAL, params).await
    }

    pub async fn read_terminal_output(
        &self,
        ctx: &ToolContext,
        terminal_id: &str,
        offset: Option<u64>,
    ) -> SupervisorResult<Value> {
        let mut params = Map::new();
        params.insert("terminal_id".into(), json!(terminal_id));
        insert_opt(&mut params, "offset", offset);
        self.forward(ctx, methods::READ_TERMINAL_OUTPUT, params).await
    }

    pub async fn list_terminals(&self, ctx: &ToolContext) -> SupervisorResult<Value> {
        self.forward(ctx, methods::LIST_TERMINALS, Map::new()).await
    }

    pub async fn kill_terminal(&self, ctx: &ToolContext, terminal_id: &str) -> SupervisorResult<Value> {
        let mut params = Map::new();
        params.insert("terminal_id".into(), json!(terminal_id));
        self.forward(ctx, methods::KILL_TERMINAL, params).await
    }

    pub async fn list_workspaces(&self, ctx: &ToolContext) -> SupervisorResult<Value> {
        self.forward(ctx, methods::LIST_WORKSPACES, Map::new()).await
    }

    pub async fn get_workspace(&self, ctx: &ToolContext, name: &str) -> SupervisorResult<Value> {
        self.forward(ctx, methods::GET_WORKSPACE, named(name)).await
    }

    /// Create a workspace, cloning `git_url` into it when given.
    pub async fn create_workspace(
        &self,
        ctx: &ToolContext,
        name: &str,
        git_url: Option<&str>,
    ) -> SupervisorResult<Value> {
        let mut params = named(name);
        insert_opt(&mut params, "git_url", git_url);
        self.forward(ctx, methods::CREATE_WORKSPACE, params).await
    }

    pub async fn delete_workspace(&self, ctx: &ToolContext, name: &str) -> SupervisorResult<Value> {
        self.forward(ctx, methods::DELETE_WORKSPACE, named(name)).await
    }

    /// Read a file inside a workspace, or relative to the home when
    /// `workspace` is `None`.
    pub async fn read_file(
        &self,
        ctx: &ToolContext,
        workspace: Option<&str>,
        path: &str,
        max_bytes: Option<u64>,
    ) -> SupervisorResult<Value> {
        let mut params = Map::new();
        insert_opt(&mut params, "workspace", workspace);
        params.insert("path".into(), json!(path));
        insert_opt(&mut params, "max_bytes", max_bytes);
        self.forward(ctx, methods::READ_FILE, params).await
    }

    async fn forward(
        &self,
        ctx: &ToolContext,
        method: &str,
        params: Map<String, Value>,
    ) -> SupervisorResult<Value> {
        self.supervisor.call(ctx, method, Value::Object(params)).await
    }
}

fn named(name: &str) -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("name".into(), json!(name));
    params
}

fn insert_opt<T: Serialize>(params: &mut Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(value) = value {
        params.insert(key.to_string(), json!(value));
    }
}
