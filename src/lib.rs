//! Multi-step approval workflows for welding procedure documents (WPS, PQR,
//! pPQR) across personal and enterprise workspaces.
pub mod api;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod definition;
pub mod error;
pub mod escalation;
pub mod history;
pub mod instance;
pub mod logging;
pub mod notify;
pub mod resolver;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;

pub use error::{ApprovalError, ValidationError};
pub use service::ApprovalService;
