pub mod bid;
pub mod driver;
pub mod location;
pub mod message;
pub mod notification;
pub mod order;
pub mod user;
