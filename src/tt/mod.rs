//! TT 主控循环：六阶段流水线、策略选择、事件流

pub mod controller;
pub mod events;
pub mod heuristics;
pub mod stages;
pub mod state;

pub use controller::{TtController, TtEventStream};
pub use events::{TtEvent, TtEventKind};
pub use heuristics::{
    classify_goal, goal_scores, infer_prompt_adaptation, score_context_relevance, select_strategy, GoalType,
    ImplementationStrategy, KeywordStrategySelector, StrategySelector,
};
pub use stages::{relevant_subset, StageEngine, StageOutputs, StageStep};
pub use state::{FramePhase, LoopFrame, Stage, TtContext, TtLoopState};
