mod element;
mod model;
mod scope;
mod splice;
pub mod xml;

pub use element::Element;
pub use model::{Document, Fragment, FragmentProvider, RawSection, SourceDocument, SourceId};
pub use scope::ConfigScope;
