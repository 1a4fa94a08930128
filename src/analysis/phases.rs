//! The fixed contract-analysis phase graph.
//!
//! The graph is code-defined: five foundation analyzers run from the same
//! opening phase, the extraction phases fan out behind it, settlement
//! logistics waits on both conditions and financial terms for its date
//! arithmetic, title review consumes uploaded diagrams when present, and a
//! final cross-validation phase reconciles figures across every other
//! phase's output.

use super::graph::{PhaseGraph, PhaseSpec, UnitSpec};
use crate::error::EngineError;

pub const PHASE_FOUNDATION: &str = "foundation";
pub const PHASE_PARTIES_PROPERTY: &str = "parties_property";
pub const PHASE_CONDITIONS: &str = "conditions";
pub const PHASE_FINANCIAL_TERMS: &str = "financial_terms";
pub const PHASE_SETTLEMENT_LOGISTICS: &str = "settlement_logistics";
pub const PHASE_TITLE_ENCUMBRANCE: &str = "title_encumbrance";
pub const PHASE_ADJUSTMENTS_OUTGOINGS: &str = "adjustments_outgoings";
pub const PHASE_CROSS_VALIDATION: &str = "cross_validation";

const FOUNDATION_UNITS: &[UnitSpec] = &[
    UnitSpec::critical("document_profile"),
    UnitSpec::optional("page_inventory"),
    UnitSpec::optional("definitions_index"),
    UnitSpec::optional("annexure_scan"),
    UnitSpec::optional("text_quality"),
];

const PARTIES_PROPERTY_UNITS: &[UnitSpec] = &[
    UnitSpec::critical("parties"),
    UnitSpec::critical("property_description"),
];

const CONDITIONS_UNITS: &[UnitSpec] = &[
    UnitSpec::optional("standard_conditions"),
    UnitSpec::critical("special_conditions"),
];

const FINANCIAL_TERMS_UNITS: &[UnitSpec] = &[
    UnitSpec::critical("price_deposit"),
    UnitSpec::optional("payment_schedule"),
];

const SETTLEMENT_UNITS: &[UnitSpec] = &[UnitSpec::critical("settlement_dates")];

const TITLE_UNITS: &[UnitSpec] = &[UnitSpec::with_diagrams("title_review")];

const ADJUSTMENTS_UNITS: &[UnitSpec] = &[UnitSpec::optional("adjustments")];

const CROSS_VALIDATION_UNITS: &[UnitSpec] = &[UnitSpec::optional("reconciliation")];

const CONTRACT_PHASES: &[PhaseSpec] = &[
    PhaseSpec {
        id: PHASE_FOUNDATION,
        predecessors: &[],
        units: FOUNDATION_UNITS,
    },
    PhaseSpec {
        id: PHASE_PARTIES_PROPERTY,
        predecessors: &[PHASE_FOUNDATION],
        units: PARTIES_PROPERTY_UNITS,
    },
    PhaseSpec {
        id: PHASE_CONDITIONS,
        predecessors: &[PHASE_FOUNDATION],
        units: CONDITIONS_UNITS,
    },
    PhaseSpec {
        id: PHASE_FINANCIAL_TERMS,
        predecessors: &[PHASE_FOUNDATION],
        units: FINANCIAL_TERMS_UNITS,
    },
    // Date arithmetic needs both the condition deadlines and the payment
    // terms, so this phase waits on both.
    PhaseSpec {
        id: PHASE_SETTLEMENT_LOGISTICS,
        predecessors: &[PHASE_CONDITIONS, PHASE_FINANCIAL_TERMS],
        units: SETTLEMENT_UNITS,
    },
    PhaseSpec {
        id: PHASE_TITLE_ENCUMBRANCE,
        predecessors: &[PHASE_PARTIES_PROPERTY],
        units: TITLE_UNITS,
    },
    PhaseSpec {
        id: PHASE_ADJUSTMENTS_OUTGOINGS,
        predecessors: &[PHASE_FINANCIAL_TERMS],
        units: ADJUSTMENTS_UNITS,
    },
    PhaseSpec {
        id: PHASE_CROSS_VALIDATION,
        predecessors: &[
            PHASE_FOUNDATION,
            PHASE_PARTIES_PROPERTY,
            PHASE_CONDITIONS,
            PHASE_FINANCIAL_TERMS,
            PHASE_SETTLEMENT_LOGISTICS,
            PHASE_TITLE_ENCUMBRANCE,
            PHASE_ADJUSTMENTS_OUTGOINGS,
        ],
        units: CROSS_VALIDATION_UNITS,
    },
];

/// Build the validated contract-analysis graph.
pub fn contract_graph() -> Result<PhaseGraph, EngineError> {
    PhaseGraph::new(CONTRACT_PHASES)
}

/// Fixed step -> percent table for the progress sequencer. Strictly
/// increasing by construction; phases appear in dependency order.
pub const STEP_PERCENTS: &[(&str, u8)] = &[
    ("received", 2),
    ("address_derived", 5),
    ("artifacts_resolved", 20),
    ("diagrams_extracted", 25),
    ("phase:foundation", 35),
    ("phase:parties_property", 45),
    ("phase:conditions", 52),
    ("phase:financial_terms", 60),
    ("phase:settlement_logistics", 70),
    ("phase:title_encumbrance", 78),
    ("phase:adjustments_outgoings", 84),
    ("phase:cross_validation", 92),
    ("synthesis", 97),
    ("completed", 100),
];

/// Percent associated with a step key, if it is a known step.
pub fn step_percent(step_key: &str) -> Option<u8> {
    STEP_PERCENTS
        .iter()
        .find(|(key, _)| *key == step_key)
        .map(|(_, percent)| *percent)
}

/// Step key for a phase id.
pub fn phase_step_key(phase_id: &str) -> String {
    format!("phase:{phase_id}")
}
