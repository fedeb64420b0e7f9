//! Branding Constants
//!
//! Single source of truth for product naming and branding.

/// Product display name
pub const PRODUCT_NAME: &str = "PortLink";

/// Binary executable name
pub const BIN_NAME: &str = "portlink";

/// Environment variable holding the bearer token
pub const TOKEN_ENV: &str = "PORTLINK_TOKEN";

/// Short description
pub const DESCRIPTION: &str = "Expose TCP services behind NAT over peer-to-peer links";
