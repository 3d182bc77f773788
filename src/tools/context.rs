//! Tool execution context, passed explicitly to every tool call.

use crate::agent::{InvocationContext, InvocationOrigin};
use crate::cron::TaskRoute;
use crate::delivery::DeliveryMode;

/// Who is calling a tool, and on behalf of which conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    pub agent_id: String,
    pub invocation: InvocationContext,
}

impl ToolContext {
    pub fn new(agent_id: impl Into<String>, invocation: InvocationContext) -> Self {
        Self {
            agent_id: agent_id.into(),
            invocation,
        }
    }

    /// Context for calls made outside any conversation (tests, maintenance).
    pub fn detached() -> Self {
        Self::new("main", InvocationContext::new(InvocationOrigin::Direct))
    }

    pub fn session_key(&self) -> Option<&str> {
        self.invocation.session_key.as_deref()
    }

    pub fn permits(&self, tool: &str) -> bool {
        self.invocation.permits_tool(tool)
    }

    /// Route for tasks created from this conversation: results come back to
    /// the same channel and chat.
    pub fn route(&self, delivery: DeliveryMode) -> TaskRoute {
        TaskRoute {
            channel: self.invocation.channel.clone(),
            chat_id: self.invocation.chat_id.clone(),
            delivery,
        }
    }
}

impl From<&InvocationContext> for ToolContext {
    fn from(ctx: &InvocationContext) -> Self {
        Self::new("main", ctx.clone())
    }
}
