//! Wire shapes for the action lists participants return from webhooks.

use serde::{Deserialize, Serialize};

/// Webhook response envelope: `{ "actions": [...] }`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionsEnvelope {
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// Common fields of the four trading actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRequest {
    pub symbol: String,
    pub quantity: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<f64>,
}

/// One participant action, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Action {
    #[serde(rename = "BUY")]
    Buy(TradeRequest),
    #[serde(rename = "SELL")]
    Sell(TradeRequest),
    #[serde(rename = "SHORT")]
    Short(TradeRequest),
    #[serde(rename = "COVER")]
    Cover(TradeRequest),
    #[serde(rename = "CANCEL_ORDER", rename_all = "camelCase")]
    CancelOrder { order_id: String },
    #[serde(rename = "RUMOR", rename_all = "camelCase")]
    Rumor {
        content: String,
        #[serde(default)]
        symbol: Option<String>,
        #[serde(default)]
        sentiment: Option<f64>,
    },
    #[serde(rename = "MESSAGE", rename_all = "camelCase")]
    Message { to: String, content: String },
    #[serde(rename = "ALLY", rename_all = "camelCase")]
    Ally { target: String },
    #[serde(rename = "ALLY_ACCEPT", rename_all = "camelCase")]
    AllyAccept { target: String },
    #[serde(rename = "ALLY_REJECT", rename_all = "camelCase")]
    AllyReject { target: String },
    #[serde(rename = "BRIBE", rename_all = "camelCase")]
    Bribe { target: String, amount: f64 },
    #[serde(rename = "WHISTLEBLOW", rename_all = "camelCase")]
    Whistleblow { target: String },
    #[serde(rename = "FLEE")]
    Flee,
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Buy(_) => "BUY",
            Action::Sell(_) => "SELL",
            Action::Short(_) => "SHORT",
            Action::Cover(_) => "COVER",
            Action::CancelOrder { .. } => "CANCEL_ORDER",
            Action::Rumor { .. } => "RUMOR",
            Action::Message { .. } => "MESSAGE",
            Action::Ally { .. } => "ALLY",
            Action::AllyAccept { .. } => "ALLY_ACCEPT",
            Action::AllyReject { .. } => "ALLY_REJECT",
            Action::Bribe { .. } => "BRIBE",
            Action::Whistleblow { .. } => "WHISTLEBLOW",
            Action::Flee => "FLEE",
        }
    }
}
