pub mod conversation;
pub mod message;
pub mod unread;
pub mod user;

pub use conversation::*;
pub use message::*;
pub use unread::*;
pub use user::*;
