//! Analysis phase graph and analyzer units.

pub mod builtin;
mod graph;
mod phases;
mod unit;

pub use graph::{PhaseGraph, PhaseSpec, UnitSpec};
pub use phases::{
    contract_graph, phase_step_key, step_percent, PHASE_ADJUSTMENTS_OUTGOINGS, PHASE_CONDITIONS,
    PHASE_CROSS_VALIDATION, PHASE_FINANCIAL_TERMS, PHASE_FOUNDATION, PHASE_PARTIES_PROPERTY,
    PHASE_SETTLEMENT_LOGISTICS, PHASE_TITLE_ENCUMBRANCE, STEP_PERCENTS,
};
pub use unit::{AnalyzerUnit, Confidence, UnitContext, UnitOutput, UnitRegistry};
