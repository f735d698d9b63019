mod effective;
mod merge;

pub use effective::{
    ConfigCollection, ConfigElement, ConfigItem, ConfigSection, EffectiveAttribute, EffectiveItem,
};
pub use merge::resolve;
