//! Port traits at the boundary of the domain.

pub mod config_port;
pub mod price_port;
pub mod report_port;
pub mod view_port;
