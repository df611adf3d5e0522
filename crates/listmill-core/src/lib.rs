//! listmill Core - the campaign send engine
//!
//! This crate provides the campaign manager (worker pool, per-campaign
//! pipes, quota pacing, sliding-window limiting), the SMTP messenger with
//! its connection pools, campaign message rendering, and the bounce
//! mailbox pipeline.

pub mod bounce;
pub mod manager;
pub mod messenger;
pub mod netio;
pub mod notify;
pub mod template;

pub use bounce::BounceManager;
pub use manager::{EngineConfig, Manager};
pub use messenger::smtp::SmtpMessenger;
pub use messenger::{Messenger, OutgoingMessage};
pub use notify::{CampaignEvent, Notifier};
