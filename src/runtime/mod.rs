//! Runtime object model
//!
//! The compiled story's object model: paths and pointers, the container
//! arena, typed values, lists, and the leaf instruction nodes the VM
//! dispatches on.

pub mod choice;
pub mod choice_point;
pub mod container;
pub mod control_command;
pub mod divert;
pub mod ink_list;
pub mod list_definition;
pub mod native_function;
pub mod object;
pub mod path;
pub mod pointer;
pub mod prng;
pub mod value;
pub mod variable;

pub use choice::Choice;
pub use choice_point::ChoicePoint;
pub use container::{ContainerId, ContainerNode, ContentTree, SearchResult};
pub use control_command::CommandType;
pub use divert::{Divert, PushPopType};
pub use ink_list::{InkList, InkListItem};
pub use list_definition::{ListDefinition, ListDefinitionsOrigin};
pub use native_function::NativeFunction;
pub use object::RuntimeObject;
pub use path::{Component, Path};
pub use pointer::Pointer;
pub use prng::Prng;
pub use value::{Value, ValueType};
