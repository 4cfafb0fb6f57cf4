pub mod admin;
pub mod auth;
pub mod conversations;
pub mod messages;
