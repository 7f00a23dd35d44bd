pub mod condition;
pub mod engine;
pub mod memory;
pub mod script;

pub use condition::{Condition, FileState, GameContext, Version};
pub use engine::{
    run, AcceptDefaults, InstallSession, PlannedFile, PresetSelector, RecordedSelections,
    ScriptOutcome, Selector, StepSelection, StepView,
};
pub use memory::SelectionMemory;
pub use script::{discover, ModuleConfig, ModuleInfo, ScriptLocation};
