//! 推理协作方的调用方：规划、反思与结果整合

pub mod planner;
pub mod prompts;
pub mod reflexion;
pub mod synthesizer;

pub use planner::{is_chat_intent, PlanOutcome, Planner};
pub use reflexion::{decide, Reflexion, ReflexionAction, ReflexionDecision};
pub use synthesizer::{Synthesizer, APOLOGY};
