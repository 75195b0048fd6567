pub mod harness;
pub mod scorer;

pub use harness::{Decision, DecisionEngineHarness, DecisionInput};
pub use scorer::{RuleBasedScorer, Scorer};
