//! Named, typed access to experiment state.
//!
//! - [`Accessors`]: getter/setter closures registered at setup
//! - [`Tracker`]: per-iteration history of selected variables
//! - [`Value`]: the dynamically typed value both of them exchange

mod accessors;
mod tracker;
mod value;

pub use accessors::{AccessorKey, Accessors};
pub use tracker::{Sample, Tracker};
pub use value::{StateValue, Value};
