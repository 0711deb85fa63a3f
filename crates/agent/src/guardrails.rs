use bazaar_core::config::AgentConfig;

use crate::tools::ToolCall;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Deny { reason_code: &'static str, user_message: String },
}

/// Which backend-requested tools may run at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailPolicy {
    pub allow_gacha_tool: bool,
    pub allow_navigation: bool,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self { allow_gacha_tool: true, allow_navigation: true }
    }
}

impl From<&AgentConfig> for GuardrailPolicy {
    fn from(config: &AgentConfig) -> Self {
        Self {
            allow_gacha_tool: config.allow_gacha_tool,
            allow_navigation: config.allow_navigation,
        }
    }
}

impl GuardrailPolicy {
    pub fn evaluate(&self, call: &ToolCall) -> GuardrailDecision {
        match call {
            ToolCall::DrawGacha if !self.allow_gacha_tool => GuardrailDecision::Deny {
                reason_code: "gacha_tool_disabled",
                user_message: "チャットからガチャを引くことはできません。ガチャページから引いてください。"
                    .to_string(),
            },
            ToolCall::NavigateToPage { .. } | ToolCall::StartListing { .. }
                if !self.allow_navigation =>
            {
                GuardrailDecision::Deny {
                    reason_code: "navigation_disabled",
                    user_message: "チャットからのページ移動は現在できません。メニューから移動してください。"
                        .to_string(),
                }
            }
            ToolCall::StartListing { price: Some(price), .. } if *price <= 0 => {
                GuardrailDecision::Deny {
                    reason_code: "listing_price_not_positive",
                    user_message: "出品価格は1円以上で指定してください。".to_string(),
                }
            }
            _ => GuardrailDecision::Allow,
        }
    }
}
