pub mod buildingblocks;
pub mod error;
pub mod protocols;

pub use error::{ProtocolError, Result};
