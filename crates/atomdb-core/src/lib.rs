pub mod budget;
pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use budget::{Budget, CancelFlag, Interrupt};
pub use config::AtomConfig;
pub use error::{AtomError, Result};
pub use events::AtomEvent;
pub use types::*;
