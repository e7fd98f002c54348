//! Device addressing shared by the HCI and L2CAP layers

pub mod types;

pub use types::*;
