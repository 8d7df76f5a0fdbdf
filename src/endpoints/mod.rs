pub mod chat;
pub mod fallback;
pub mod limits;
pub mod status;
