//! Client session runtime: keeps one signed-in tab's conversation list, open
//! conversation and unread badge consistent with the server by combining
//! HTTP command responses with relay frames.

pub mod api;
pub mod runtime;
pub mod session;

pub use api::{ChatApi, ClientError, HttpChatApi};
pub use runtime::{
    DeliveryStatus, Effect, Notification, SessionRuntime, SessionSnapshot, ViewState,
};
pub use session::{ClientSession, Command, FrameSink, SessionHandle};
