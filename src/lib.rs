//! inkrun - a runtime interpreter for compiled Ink stories
//!
//! This library loads a compiled story document (the tagged JSON produced
//! by the ink compiler), executes it as a cooperative stack-based VM, and
//! exposes a line-by-line continue/choose API plus save/load, named flows,
//! variable observers, and host-bound external functions.

pub mod json;
pub mod runtime;
pub mod state;
pub mod story;

pub use runtime::{
    Choice, CommandType, ContentTree, InkList, InkListItem, ListDefinition,
    ListDefinitionsOrigin, Path, Pointer, RuntimeObject, Value,
};
pub use state::{StoryState, DEFAULT_FLOW_NAME};
pub use story::errors::{ErrorType, StoryError};
pub use story::{FunctionResult, ObserverId, Story, INK_VERSION_CURRENT};
