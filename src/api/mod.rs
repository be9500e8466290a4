// =============================================================================
// Operator API — REST endpoints and authentication
// =============================================================================

pub mod auth;
pub mod rest;
