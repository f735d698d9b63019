mod commit;
mod section;

pub use section::EditableSection;
