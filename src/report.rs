//! Plain-text projection of a quota snapshot.

use crate::model::{QuotaBand, QuotaSnapshot};

/// Render the quota report table. `selected` marks the chosen model row; a
/// selection that is missing from the current list is called out in a footer
/// instead of being dropped.
pub fn render(snapshot: &QuotaSnapshot, selected: Option<&str>) -> String {
    let mut out = String::new();
    let rule = "=".repeat(60);

    out.push_str(&format!("{rule}\n  ANTIGRAVITY MODEL QUOTA REPORT\n{rule}\n"));

    let account = &snapshot.account;
    if !account.name.is_empty() || !account.email.is_empty() {
        out.push_str(&format!("\n  User: {} ({})\n", account.name, account.email));
    }
    if !account.plan_name.is_empty() {
        out.push_str(&format!("  Plan: {}\n", account.plan_name));
    }
    out.push_str(&format!(
        "  Prompt Credits: {}  |  Flow Credits: {}\n",
        account.prompt_credits.as_deref().unwrap_or("?"),
        account.flow_credits.as_deref().unwrap_or("?"),
    ));

    if snapshot.models.is_empty() {
        out.push_str("\n  No model quota data found in response.\n");
    } else {
        out.push_str(&format!("\n  {:<37} {:>7}  {}\n", "Model", "Quota", "Resets At"));
        out.push_str(&format!("  {}\n", "-".repeat(60)));
        for model in &snapshot.models {
            let marker = if selected == Some(model.label.as_str()) {
                "*"
            } else {
                " "
            };
            let quota = match model.remaining_fraction {
                Some(fraction) => {
                    format!("{} {:>3}%", band_icon(model.band()), (fraction * 100.0) as i64)
                }
                None => "   N/A".to_owned(),
            };
            out.push_str(&format!(
                "  {marker}{:<36} {quota:>7}  {}\n",
                model.label,
                model.reset_time_display(),
            ));
        }
    }

    if let Some(label) = selected {
        if !snapshot.models.iter().any(|model| model.label == label) {
            out.push_str(&format!("\n  Selected model `{label}` is not in the current list.\n"));
        }
    }

    out.push_str(&format!("{rule}\n"));
    out
}

fn band_icon(band: QuotaBand) -> &'static str {
    match band {
        QuotaBand::High => "🟢",
        QuotaBand::Medium => "🟡",
        QuotaBand::Low => "🔴",
        QuotaBand::Unmetered => "  ",
    }
}
