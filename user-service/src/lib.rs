//! User account service.
//!
//! Answers `get_user_by_id_queue` and `user_info_queue` from MongoDB and
//! talks to the OTP and notification services through [`producers`].

pub mod consumers;
pub mod producers;
pub mod settings;
pub mod store;
pub mod telemetry;
