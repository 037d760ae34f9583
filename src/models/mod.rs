//! Data models for the Twitch drops mining core.

pub mod benefit;
pub mod campaign;
pub mod channel;
pub mod drop;
pub mod game;
pub mod gql;

pub use benefit::{Benefit, BenefitType};
pub use campaign::{CampaignStatus, DropsCampaign};
pub use channel::Channel;
pub use drop::TimedDrop;
pub use game::Game;
pub use gql::*;
