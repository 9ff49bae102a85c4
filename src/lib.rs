pub mod cli;
pub mod config;
pub mod email;

pub use config::MailConfig;
pub use email::{EmailCoordinator, EmailError, EmailResult};
