//! Notification fan-out: the queue job handler and its delivery channels.
//!
//! A job carries one [`ActionEvent`](tally_common::types::ActionEvent). The
//! [`NotificationWorker`] resolves recipients, persists one in-app row per
//! recipient, then delivers over browser push and chat webhooks in parallel.

pub mod push;
pub mod render;
pub mod webhook;
pub mod worker;

pub use push::{PushChannel, PushError, PushPayload, PushReport, PushTransport, WebPushTransport};
pub use webhook::{WebhookChannel, WebhookMessage, WebhookReport};
pub use worker::{FanOutReport, NotificationWorker};
