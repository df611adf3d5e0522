//! Repository layer for data access

pub mod bounces;
pub mod campaigns;
pub mod subscribers;

pub use bounces::BounceRepository;
pub use campaigns::CampaignRepository;
pub use subscribers::SubscriberRepository;
