//! HTTP collaborators for the two CRM accounts.
pub mod destination;
pub mod http;
pub mod source;
