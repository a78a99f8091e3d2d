//! Query evaluation: result-set buckets and the set-algebra engine.

pub mod evaluator;
pub mod hits;

pub use evaluator::{BitMode, Evaluator, HitDoc, SetOp, SortOrder, MAX_BANKS};
pub use hits::{Extra, ExtraKind, Hit, HitList, Score};
