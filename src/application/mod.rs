//! Application layer: agent and lead runtimes plus response analysis.

pub mod agent;
pub mod analyzer;
pub mod decompose;
pub mod lead;

pub use agent::{AgentHarness, AgentRuntime};
pub use analyzer::{AnalysisVerdict, RalphStatus, ResponseAnalyzer};
pub use decompose::parse_decomposition;
pub use lead::{LeadOrchestrator, TeamReport};
