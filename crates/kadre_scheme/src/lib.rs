pub mod deploy;
pub mod entry;
pub mod error;
pub mod image;
pub mod scheme;

pub use deploy::{escape_str, parse_deploy, serialize_image};
pub use entry::{
    Action, ActionCond, ActionIo, BoundSymbol, Entry, EntryId, EntryMode, EntryPurpose,
};
pub use error::{SchemeError, SchemeErrorStack};
pub use image::{ActionImage, EntryImage, PluginImage, SchemeImage};
pub use scheme::{Plugin, Scheme};
