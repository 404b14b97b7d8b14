//! Charging policy engine
//!
//! An ordered list of rules decides how many amps all slaves may share.
//! The first rule whose conditions match (or whose latch is still running)
//! is enforced.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ PolicyConfig│────▶│ build_rules  │────▶│ PolicyEngine │
//! │  (yaml)     │     │ (extensions) │     │  (evaluate)  │
//! └─────────────┘     └──────────────┘     └──────┬───────┘
//!                                                 │ PolicyAction
//!                     ┌──────────────┐            ▼
//!                     │PolicyContext │◀──── caller applies
//!                     │ (settings..) │      budget/flex/tasks
//!                     └──────────────┘
//! ```

pub mod condition;
mod defaults;
mod engine;
pub mod error;
pub mod types;
pub mod value;

pub use condition::{check_conditions, Check, Condition};
pub use defaults::default_policy;
pub use engine::{build_rules, CompiledRule, PolicyAction, PolicyEngine};
pub use error::{PolicyError, Result};
pub use types::{EngineConfig, Hook, PolicyConfig, PolicyExtend, PolicyRule, Restriction, Webhooks};
pub use value::{PolicyContext, PolicyFunction, PolicyValue, TimeField, Value};
