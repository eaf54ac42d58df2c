//! Entity model and declarative state machine runtime shared by every
//! Edison persistence backend.

pub mod entity;
pub mod frontmatter;
pub mod ids;
pub mod qa;
pub mod section;
pub mod session;
pub mod state_machine;
pub mod task;

pub use entity::{BaseEntity, HistoryEntry, Metadata};
pub use ids::{EntityId, InvalidId};
pub use qa::QaRecord;
pub use section::{ParsedSection, SectionMode, SectionRegistry};
pub use session::Session;
pub use state_machine::{
    ConditionSpec, GuardResult, Registries, StateMachineError, StateMachineRuntime,
    StateMachineSpec, StateSpec, TransitionContext, TransitionPlan, TransitionSpec,
};
pub use task::Task;
