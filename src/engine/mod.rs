pub mod board;
pub mod chat;
pub mod lifecycle;
pub mod notify;
pub mod scoring;
pub mod tracking;
