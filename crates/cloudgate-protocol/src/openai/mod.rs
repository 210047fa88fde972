pub mod audio;
pub mod chat;
pub mod completions;
pub mod images;
pub mod models;
pub mod responses;

pub use audio::*;
pub use chat::*;
pub use completions::*;
pub use images::*;
pub use models::*;
pub use responses::*;
