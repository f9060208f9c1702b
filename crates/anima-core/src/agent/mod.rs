pub mod output;
pub mod prompt;
pub mod tool_loop;
pub mod tools;

pub use prompt::AnalysisContext;
pub use tool_loop::{run_analysis, AgentLoopConfig, AnalysisRun};
pub use tools::{AgentTool, CiteTool, SearchCorpusTool, SearchMode, ToolOutcome, ToolRegistry};
