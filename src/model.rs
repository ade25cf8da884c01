//! Normalized quota types and the raw `GetUserStatus` response shape.

use serde::Deserialize;
use serde_json::Value;

/// Sentinel used when a model entry arrives without a label.
pub const UNKNOWN_MODEL_LABEL: &str = "Unknown";

/// Per-model quota entry, normalized from the server response.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelQuota {
    pub label: String,
    /// Remaining quota in `[0, 1]`; `None` means the model is not metered.
    pub remaining_fraction: Option<f64>,
    /// ISO-8601 reset timestamp, or empty when the server omitted it.
    pub reset_time: String,
}

/// Coarse usage band derived from the remaining fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaBand {
    High,
    Medium,
    Low,
    Unmetered,
}

impl ModelQuota {
    pub fn band(&self) -> QuotaBand {
        match self.remaining_fraction {
            None => QuotaBand::Unmetered,
            Some(fraction) if fraction > 0.5 => QuotaBand::High,
            Some(fraction) if fraction > 0.2 => QuotaBand::Medium,
            Some(_) => QuotaBand::Low,
        }
    }

    /// Reset timestamp trimmed to `YYYY-MM-DD HH:MM` for display.
    pub fn reset_time_display(&self) -> String {
        let trimmed: String = self.reset_time.chars().take(16).collect();
        trimmed.replace('T', " ")
    }
}

/// Account and plan summary carried alongside the model list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountInfo {
    pub name: String,
    pub email: String,
    pub plan_name: String,
    pub prompt_credits: Option<String>,
    pub flow_credits: Option<String>,
}

/// One successful fetch: replaces the previous snapshot wholesale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuotaSnapshot {
    pub account: AccountInfo,
    pub models: Vec<ModelQuota>,
}

// ---------------------------------------------------------------------------
// Raw response DTOs. Every nested field defaults so that partial responses
// (including zero models) deserialize as valid successes.
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserStatusResponse {
    pub user_status: UserStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserStatus {
    pub name: String,
    pub email: String,
    pub plan_status: PlanStatus,
    pub cascade_model_config_data: CascadeModelConfigData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanStatus {
    pub plan_info: PlanInfo,
    pub available_prompt_credits: Option<Value>,
    pub available_flow_credits: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanInfo {
    pub plan_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CascadeModelConfigData {
    pub client_model_configs: Vec<ClientModelConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientModelConfig {
    pub label: Option<String>,
    pub quota_info: QuotaInfo,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotaInfo {
    pub remaining_fraction: Option<f64>,
    pub reset_time: String,
}

impl UserStatusResponse {
    /// Flatten the raw response into the normalized snapshot.
    pub fn into_snapshot(self) -> QuotaSnapshot {
        let status = self.user_status;
        let account = AccountInfo {
            name: status.name,
            email: status.email,
            plan_name: status.plan_status.plan_info.plan_name,
            prompt_credits: credits_display(status.plan_status.available_prompt_credits),
            flow_credits: credits_display(status.plan_status.available_flow_credits),
        };
        let models = status
            .cascade_model_config_data
            .client_model_configs
            .into_iter()
            .map(|config| ModelQuota {
                label: config
                    .label
                    .filter(|label| !label.is_empty())
                    .unwrap_or_else(|| UNKNOWN_MODEL_LABEL.to_owned()),
                remaining_fraction: config.quota_info.remaining_fraction,
                reset_time: config.quota_info.reset_time,
            })
            .collect();
        QuotaSnapshot { account, models }
    }
}

/// Credits arrive as either a JSON number or a string depending on the
/// server's proto-JSON encoding; normalize both to a display string.
fn credits_display(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    }
}
