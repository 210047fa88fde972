pub mod messages;
pub mod stream;
pub mod types;

pub use messages::*;
pub use stream::*;
pub use types::*;
