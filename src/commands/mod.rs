// Provisioning
pub mod provision;

// Inspection without a host
pub mod plan;
pub mod roles;
