//! Data Transfer Objects (DTOs) for API requests and responses

pub mod account;
pub mod auth;
pub mod billing;
pub mod common;
pub mod review;
pub mod tier;

pub use account::*;
pub use auth::*;
pub use billing::*;
pub use common::*;
pub use review::*;
pub use tier::*;
