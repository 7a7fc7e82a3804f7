use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::api::AdminApi;
use crate::model::AdminUser;
use crate::rpc::RpcClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    GetUser,
    HideComment,
    ShowComment,
}

impl AdminAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminAction::GetUser => "getUser",
            AdminAction::HideComment => "hideComment",
            AdminAction::ShowComment => "showComment",
        }
    }
}

#[derive(Debug, Deserialize)]
struct UsersEnvelope {
    #[serde(default)]
    users: Vec<AdminUser>,
}

/// Privileged operations executed inside the admin auth frame.
pub struct AdminFrameApi {
    rpc: Arc<RpcClient>,
    timeout: Option<Duration>,
}

impl AdminFrameApi {
    pub fn new(rpc: Arc<RpcClient>, timeout: Option<Duration>) -> Self {
        Self { rpc, timeout }
    }

    fn invoke(&self, action: AdminAction, args: Map<String, Value>) -> Result<Value> {
        let call = self.rpc.call(action.as_str(), args)?;
        Ok(call.wait(self.timeout)?)
    }

    fn with_id(id: &str) -> Map<String, Value> {
        let mut args = Map::new();
        args.insert("id".into(), Value::from(id));
        args
    }
}

impl AdminApi for AdminFrameApi {
    fn current_user(&self) -> Result<Option<AdminUser>> {
        let result = self
            .invoke(AdminAction::GetUser, Map::new())
            .context("fetch admin user")?;
        let envelope: UsersEnvelope =
            serde_json::from_value(result).context("decode admin users")?;
        Ok(envelope.users.into_iter().next())
    }

    fn hide_comment(&self, comment_id: &str) -> Result<()> {
        self.invoke(AdminAction::HideComment, Self::with_id(comment_id))
            .with_context(|| format!("hide comment {comment_id}"))?;
        Ok(())
    }

    fn show_comment(&self, comment_id: &str) -> Result<()> {
        self.invoke(AdminAction::ShowComment, Self::with_id(comment_id))
            .with_context(|| format!("show comment {comment_id}"))?;
        Ok(())
    }
}
