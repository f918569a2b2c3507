pub mod flags;
pub mod mailbox;
pub mod message;
pub mod search;
