use crate::error::{NlqError, Result};
use serde::{Deserialize, Serialize};

/// Caller's tenant, supplied by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

/// Body of `/chat`, `/chat/stream` and `/generate-sql`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub context: Option<TenantContext>,
    #[serde(default)]
    pub conversation_history: Vec<ConversationTurn>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: Some(TenantContext {
                tenant_id: tenant_id.into(),
            }),
            conversation_history: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<ConversationTurn>) -> Self {
        self.conversation_history = history;
        self
    }

    /// Structural checks: a non-empty question and a tenant. The tenant is
    /// never defaulted.
    pub fn validate(&self) -> Result<&TenantContext> {
        if self.message.trim().is_empty() {
            return Err(NlqError::InvalidRequest("message must not be empty".to_string()));
        }
        match &self.context {
            Some(ctx) if !ctx.tenant_id.trim().is_empty() => Ok(ctx),
            _ => Err(NlqError::InvalidRequest(
                "context.tenant_id is required".to_string(),
            )),
        }
    }
}

/// Body of `/execute-sql`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteSqlRequest {
    pub sql: String,
    pub context: Option<TenantContext>,
}

impl ExecuteSqlRequest {
    pub fn validate(&self) -> Result<&TenantContext> {
        match &self.context {
            Some(ctx) if !ctx.tenant_id.trim().is_empty() => Ok(ctx),
            _ => Err(NlqError::InvalidRequest(
                "context.tenant_id is required".to_string(),
            )),
        }
    }
}
