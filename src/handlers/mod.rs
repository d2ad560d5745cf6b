pub mod config;
pub mod sessions;

pub use config::{get_config, update_config};
pub use sessions::{get_session, issue_resume_token, list_sessions};
