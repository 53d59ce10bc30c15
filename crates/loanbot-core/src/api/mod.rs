//! Remote loan-management API: entities and the client port.

pub mod client;
pub mod types;
