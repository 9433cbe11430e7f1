pub mod controller;
pub mod error;
pub mod request;

pub use controller::{JoinConfig, JoinController};
pub use error::JoinError;
pub use request::{JoinOutcome, JoinRequest, JoinStatus};
