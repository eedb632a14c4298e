//! Human-readable renderings of an aggregated judge result.

use super::{AggregatedJudgeResult, JudgeResult};
use crate::util::truncate_chars;

/// Discord's 2000 character message limit, minus headroom.
pub const DEFAULT_DISCORD_CAP: usize = 1900;

/// Per-judge reasoning budgets tried in order until the message fits.
const REASONING_BUDGETS: [Option<usize>; 5] = [None, Some(400), Some(150), Some(60), Some(0)];

fn status_word(result: &JudgeResult) -> &'static str {
    match (result.passed, result.required) {
        (true, _) => "PASS",
        (false, true) => "FAIL",
        (false, false) => "WARN",
    }
}

pub fn format_console(agg: &AggregatedJudgeResult) -> String {
    let mut out = format!(
        "Judges: {} - {}\n",
        if agg.passed { "PASSED" } else { "FAILED" },
        agg.summary
    );
    for result in &agg.results {
        out.push_str(&format!(
            "  [{}] {}{} ({:.0}%): {}\n",
            status_word(result),
            result.persona,
            if result.required { "" } else { " (optional)" },
            result.confidence * 100.0,
            result.verdict
        ));
        if !result.reasoning.is_empty() {
            for line in result.reasoning.lines() {
                out.push_str(&format!("      {}\n", line));
            }
        }
    }
    let suggestions = agg.merged_suggestions();
    if !suggestions.is_empty() {
        out.push_str("  Suggestions:\n");
        for s in suggestions {
            out.push_str(&format!("    - {}\n", s));
        }
    }
    out
}

fn render_discord(agg: &AggregatedJudgeResult, reasoning_budget: Option<usize>) -> String {
    let icon = if agg.passed { "✅" } else { "❌" };
    let mut out = format!("{} **Judges {}**: {}\n", icon, if agg.passed { "passed" } else { "failed" }, agg.summary);
    for result in &agg.results {
        let mark = match status_word(result) {
            "PASS" => "🟢",
            "FAIL" => "🔴",
            _ => "🟡",
        };
        out.push_str(&format!(
            "{} **{}**{} ({:.0}%): {}\n",
            mark,
            result.persona,
            if result.required { "" } else { " _(optional)_" },
            result.confidence * 100.0,
            result.verdict
        ));
        let reasoning = match reasoning_budget {
            None => result.reasoning.clone(),
            Some(0) => String::new(),
            Some(n) => truncate_chars(&result.reasoning, n),
        };
        if !reasoning.is_empty() {
            out.push_str(&format!("> {}\n", reasoning.replace('\n', "\n> ")));
        }
    }
    let suggestions = agg.merged_suggestions();
    if !suggestions.is_empty() {
        out.push_str("**Suggestions**\n");
        for s in suggestions {
            out.push_str(&format!("• {}\n", s));
        }
    }
    out
}

/// Chat-message rendering. Never longer than `cap` characters: reasoning is
/// shortened first, then the whole message is cut.
pub fn format_discord(agg: &AggregatedJudgeResult, cap: usize) -> String {
    let mut message = render_discord(agg, REASONING_BUDGETS[0]);
    for budget in &REASONING_BUDGETS[1..] {
        if message.chars().count() <= cap {
            return message;
        }
        message = render_discord(agg, *budget);
    }
    truncate_chars(&message, cap)
}
