pub mod hub;

pub use hub::{FanoutHub, HubConfig, Subscription};
