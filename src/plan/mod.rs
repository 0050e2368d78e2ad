pub mod ast;
pub mod binder;
pub mod cache;
pub mod cost;
pub mod fingerprint;
pub mod logical;
pub mod normalize;
pub mod planner;

pub use cache::{PlanCache, ResultCache};
pub use planner::{plan_statement, PhysicalPlan};
