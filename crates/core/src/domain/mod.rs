pub mod conversation;
pub mod item;
pub mod persona;
pub mod user;
