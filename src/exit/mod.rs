// =============================================================================
// Exit management — pure evaluation of take-profit / stop-loss / trailing /
// time-based exit conditions
// =============================================================================

pub mod evaluator;

pub use evaluator::{evaluate, ExitSignal};
