pub mod cache;
pub mod cleanup;
pub mod inbox;
pub mod memory;
pub mod notifications;
pub mod producer;
pub mod settings;
pub mod subscriptions;
