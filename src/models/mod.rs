pub mod chat;
pub mod document;
pub mod vector;

pub use chat::*;
pub use document::*;
pub use vector::*;
