//! Resource model: the four resource kinds, their fields and validation.

mod adapter;
mod disk;
mod machine;
pub mod schema;
mod spec;
mod switch;
pub mod types;
mod value;

pub use adapter::PortMirroring;
pub use disk::DiskType;
pub use machine::{AutoStartAction, AutoStopAction};
pub use schema::{Field, FieldType, Schema};
pub use spec::{normalize, RawSpec, Resolved, ResourceKind, ResourceSpec};
pub use switch::SwitchType;
pub use value::{Input, OutputRef, Properties, Value, ID_OUTPUT};
