mod registry;
mod types;
mod value;

pub use registry::{SchemaRef, SchemaRegistry, SchemaSource};
pub use types::{
    AttributeSchema, AttributeType, CollectionSchema, EnumValue, ItemKey, OverrideMode,
    SchemaNode, SectionSchema, Validation,
};
pub use value::{Value, format_time_span, parse_time_span};
