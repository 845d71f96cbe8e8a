pub mod callbacks;
pub mod health;
pub mod jobs;
pub mod realtime;
pub mod uploads;
