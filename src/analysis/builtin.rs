//! Deterministic analyzer units.
//!
//! These regex-driven extractors serve two roles: they are the synthesized
//! fallback when a non-critical LLM-backed unit fails, and they make every
//! unit key in the fixed graph resolvable without external collaborators,
//! which is what the engine's own tests run against.

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;

use super::graph::PhaseGraph;
use super::unit::{AnalyzerUnit, Confidence, UnitContext, UnitOutput, UnitRegistry};
use crate::error::EngineError;
use crate::models::ArtifactKind;

/// Date patterns seen in contract text.
static DATE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        // ISO format with various separators: 2024-01-15, 2024/01/15
        (
            Regex::new(r"\b(\d{4})[-/](\d{2})[-/](\d{2})\b").unwrap(),
            "ymd",
        ),
        // Day-first format common in contracts: 15/01/2024, 15-01-2024
        (
            Regex::new(r"\b(\d{1,2})[-/](\d{1,2})[-/](\d{4})\b").unwrap(),
            "dmy",
        ),
    ]
});

/// Monetary amounts: $1,250,000.00 and bare 1250000.00 following "$".
static AMOUNT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\s?([0-9][0-9,]*)(?:\.([0-9]{2}))?").unwrap());

/// Scan text for recognizable dates.
pub fn scan_dates(text: &str) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    for (pattern, order) in DATE_PATTERNS.iter() {
        for caps in pattern.captures_iter(text) {
            let parsed = match *order {
                "ymd" => parse_date(&caps[1], &caps[2], &caps[3]),
                _ => parse_date(&caps[3], &caps[2], &caps[1]),
            };
            if let Some(date) = parsed {
                if !dates.contains(&date) {
                    dates.push(date);
                }
            }
        }
    }
    dates
}

fn parse_date(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    let day: u32 = day.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Scan text for monetary amounts, returned in cents to avoid float drift.
pub fn scan_amounts(text: &str) -> Vec<i64> {
    let mut amounts = Vec::new();
    for caps in AMOUNT_PATTERN.captures_iter(text) {
        let whole: String = caps[1].chars().filter(|c| c.is_ascii_digit()).collect();
        let Ok(dollars) = whole.parse::<i64>() else {
            continue;
        };
        let cents: i64 = caps
            .get(2)
            .and_then(|m| m.as_str().parse::<i64>().ok())
            .unwrap_or(0);
        let total = dollars.saturating_mul(100).saturating_add(cents);
        if !amounts.contains(&total) {
            amounts.push(total);
        }
    }
    amounts
}

/// Keyword windows per unit key. The heuristic unit reports dates and
/// amounts found anywhere in the text plus which of its keywords appear.
fn keywords_for(unit_key: &str) -> &'static [&'static str] {
    match unit_key {
        "document_profile" => &["contract", "agreement", "deed", "sale"],
        "page_inventory" => &[],
        "definitions_index" => &["definitions", "interpretation", "means"],
        "annexure_scan" => &["annexure", "schedule", "attachment", "exhibit"],
        "text_quality" => &[],
        "parties" => &["vendor", "purchaser", "buyer", "seller", "party"],
        "property_description" => &["land", "lot", "plan", "title reference", "property"],
        "standard_conditions" => &["standard conditions", "general conditions"],
        "special_conditions" => &["special condition", "subject to"],
        "price_deposit" => &["purchase price", "deposit", "balance"],
        "payment_schedule" => &["instalment", "payable", "payment"],
        "settlement_dates" => &["settlement", "completion", "business days"],
        "title_review" => &["easement", "encumbrance", "covenant", "caveat"],
        "adjustments" => &["adjustment", "outgoings", "rates", "apportion"],
        "reconciliation" => &[],
        _ => &[],
    }
}

/// Regex-driven analyzer for one unit key.
pub struct HeuristicUnit {
    key: String,
    wants_diagrams: bool,
}

impl HeuristicUnit {
    pub fn new(key: &str, wants_diagrams: bool) -> Self {
        Self {
            key: key.to_string(),
            wants_diagrams,
        }
    }
}

#[async_trait]
impl AnalyzerUnit for HeuristicUnit {
    fn key(&self) -> &str {
        &self.key
    }

    async fn analyze(&self, ctx: &UnitContext) -> Result<UnitOutput, EngineError> {
        let text = ctx.full_text.as_str();
        let lowered = text.to_lowercase();

        let keywords_found: Vec<&str> = keywords_for(&self.key)
            .iter()
            .copied()
            .filter(|kw| lowered.contains(kw))
            .collect();
        let dates: Vec<String> = scan_dates(text)
            .into_iter()
            .map(|d| d.to_string())
            .collect();
        let amounts = scan_amounts(text);
        let page_count = ctx.artifacts.of_kind(ArtifactKind::PageText).count();

        let mut confidence = if !keywords_found.is_empty() && (!dates.is_empty() || !amounts.is_empty())
        {
            Confidence::High
        } else if !keywords_found.is_empty() {
            Confidence::Medium
        } else {
            Confidence::Low
        };

        let mut output = UnitOutput::new(
            serde_json::json!({
                "unit": self.key,
                "keywords_found": keywords_found,
                "dates": dates,
                "amounts": amounts,
                "page_count": page_count,
                "diagram_count": ctx.diagrams.len(),
            }),
            confidence,
        );

        if self.wants_diagrams && ctx.diagrams.is_empty() {
            confidence = Confidence::Low;
            output.confidence = confidence;
            output = output.with_warning("no diagrams supplied; review limited to text");
        }

        Ok(output)
    }
}

/// Terminal reconciliation: compares dates and amounts reported by upstream
/// phases and flags pairs whose non-empty figure sets do not overlap at all.
pub struct ReconciliationUnit;

#[async_trait]
impl AnalyzerUnit for ReconciliationUnit {
    fn key(&self) -> &str {
        "reconciliation"
    }

    async fn analyze(&self, ctx: &UnitContext) -> Result<UnitOutput, EngineError> {
        let mut per_phase: Vec<(String, Vec<String>, Vec<i64>)> = Vec::new();
        for (phase, units) in &ctx.upstream {
            let mut dates: Vec<String> = Vec::new();
            let mut amounts: Vec<i64> = Vec::new();
            for output in units.values() {
                if let Some(list) = output.value.get("dates").and_then(|v| v.as_array()) {
                    for d in list.iter().filter_map(|v| v.as_str()) {
                        if !dates.contains(&d.to_string()) {
                            dates.push(d.to_string());
                        }
                    }
                }
                if let Some(list) = output.value.get("amounts").and_then(|v| v.as_array()) {
                    for a in list.iter().filter_map(|v| v.as_i64()) {
                        if !amounts.contains(&a) {
                            amounts.push(a);
                        }
                    }
                }
            }
            per_phase.push((phase.clone(), dates, amounts));
        }

        let mut contradictions = Vec::new();
        for i in 0..per_phase.len() {
            for j in (i + 1)..per_phase.len() {
                let (left, left_dates, left_amounts) = &per_phase[i];
                let (right, right_dates, right_amounts) = &per_phase[j];
                if !left_dates.is_empty()
                    && !right_dates.is_empty()
                    && left_dates.iter().all(|d| !right_dates.contains(d))
                {
                    contradictions.push(serde_json::json!({
                        "figure": "dates",
                        "left_phase": left,
                        "right_phase": right,
                    }));
                }
                if !left_amounts.is_empty()
                    && !right_amounts.is_empty()
                    && left_amounts.iter().all(|a| !right_amounts.contains(a))
                {
                    contradictions.push(serde_json::json!({
                        "figure": "amounts",
                        "left_phase": left,
                        "right_phase": right,
                    }));
                }
            }
        }

        let confidence = if contradictions.is_empty() {
            Confidence::High
        } else {
            Confidence::Medium
        };

        Ok(UnitOutput::new(
            serde_json::json!({
                "phases_compared": per_phase.len(),
                "contradictions": contradictions,
            }),
            confidence,
        ))
    }
}

/// Fallback recorded in place of a failed non-critical unit.
pub fn fallback_output(unit_key: &str, reason: &str) -> UnitOutput {
    UnitOutput::new(serde_json::Value::Null, Confidence::Low).with_warning(format!(
        "unit {unit_key} degraded to fallback: {reason}"
    ))
}

/// Register a deterministic unit for every unit key the graph declares.
pub fn register_builtins(registry: &mut UnitRegistry, graph: &PhaseGraph) {
    for phase in graph.phases() {
        for unit in phase.units {
            if unit.key == "reconciliation" {
                registry.register(Arc::new(ReconciliationUnit));
            } else {
                registry.register(Arc::new(HeuristicUnit::new(unit.key, unit.wants_diagrams)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ArtifactSet;
    use std::collections::BTreeMap;

    fn ctx(text: &str) -> UnitContext {
        UnitContext {
            run_id: "r1".into(),
            document_id: "d1".into(),
            artifacts: Arc::new(ArtifactSet::default()),
            full_text: Arc::new(text.to_string()),
            upstream: BTreeMap::new(),
            diagrams: Vec::new(),
        }
    }

    #[test]
    fn test_scan_dates_iso_and_dmy() {
        let dates = scan_dates("settlement on 2024-03-15, notice by 01/02/2024");
        assert!(dates.contains(&NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()));
        assert!(dates.contains(&NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()));
    }

    #[test]
    fn test_scan_dates_rejects_impossible() {
        assert!(scan_dates("dated 2024-13-45").is_empty());
    }

    #[test]
    fn test_scan_amounts_cents() {
        let amounts = scan_amounts("price $1,250,000.00 with deposit $ 125,000");
        assert_eq!(amounts, vec![125_000_000, 12_500_000]);
    }

    #[tokio::test]
    async fn test_heuristic_unit_confidence() {
        let unit = HeuristicUnit::new("price_deposit", false);
        let out = unit
            .analyze(&ctx("the purchase price is $500,000.00 payable 2024-06-01"))
            .await
            .unwrap();
        assert_eq!(out.confidence, Confidence::High);
        assert_eq!(out.value["amounts"][0], serde_json::json!(50_000_000));

        let out = unit.analyze(&ctx("nothing relevant here")).await.unwrap();
        assert_eq!(out.confidence, Confidence::Low);
    }

    #[tokio::test]
    async fn test_diagram_wanting_unit_degrades_without_diagrams() {
        let unit = HeuristicUnit::new("title_review", true);
        let out = unit
            .analyze(&ctx("an easement burdens the lot, registered 2020-01-01"))
            .await
            .unwrap();
        assert_eq!(out.confidence, Confidence::Low);
        assert!(!out.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_reconciliation_flags_disjoint_amounts() {
        let mut context = ctx("");
        let mut phase_a = BTreeMap::new();
        phase_a.insert(
            "price_deposit".to_string(),
            UnitOutput::new(
                serde_json::json!({"amounts": [100], "dates": []}),
                Confidence::High,
            ),
        );
        let mut phase_b = BTreeMap::new();
        phase_b.insert(
            "adjustments".to_string(),
            UnitOutput::new(
                serde_json::json!({"amounts": [200], "dates": []}),
                Confidence::High,
            ),
        );
        context.upstream.insert("financial_terms".into(), phase_a);
        context
            .upstream
            .insert("adjustments_outgoings".into(), phase_b);

        let out = ReconciliationUnit.analyze(&context).await.unwrap();
        let contradictions = out.value["contradictions"].as_array().unwrap();
        assert_eq!(contradictions.len(), 1);
        assert_eq!(contradictions[0]["figure"], "amounts");
        assert_eq!(out.confidence, Confidence::Medium);
    }

    #[test]
    fn test_register_builtins_covers_graph() {
        let graph = crate::analysis::phases::contract_graph().unwrap();
        let mut registry = UnitRegistry::new();
        register_builtins(&mut registry, &graph);
        for phase in graph.phases() {
            for unit in phase.units {
                assert!(registry.get(unit.key).is_some(), "missing {}", unit.key);
            }
        }
    }
}
