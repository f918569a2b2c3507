pub mod mailbox;
pub mod message;
pub mod store;
pub mod subscription;

pub use mailbox::StoreMailboxMapper;
pub use message::StoreMessageMapper;
pub use subscription::StoreSubscriptionMapper;
