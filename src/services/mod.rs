pub mod auth;
pub mod messaging;
pub mod moderation;
pub mod users;

pub use auth::{AuthService, Claims, Identity};
pub use messaging::{Destination, MessagingService, ReadReceipt};
pub use moderation::ModerationService;
pub use users::{UserAdminService, UserUpdate};
