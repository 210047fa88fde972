pub mod generate;
pub mod models;
pub mod types;

pub use generate::*;
pub use models::*;
pub use types::*;
