//! Stable error-code literals surfaced in response envelopes.
//!
//! Codes are grouped by prefix (`AUTH`, `API`, `GTW`, ...) and numbered
//! within each family. They are part of the external contract: clients
//! match on them, so existing literals never change meaning.

// Authentication
pub const AUTH_MISSING_CREDENTIALS: &str = "AUTH001";
pub const AUTH_INVALID_CREDENTIALS: &str = "AUTH002";
pub const AUTH_TOKEN_INVALID: &str = "AUTH003";
pub const AUTH_TOKEN_MISSING: &str = "AUTH004";
pub const AUTH_TOKEN_EXPIRED: &str = "AUTH005";
pub const AUTH_USER_INACTIVE: &str = "AUTH007";
pub const AUTH_UNEXPECTED_ERROR: &str = "AUTH900";
pub const JWT_DECODE_ERROR: &str = "JWT001";

// API configuration
pub const API_NOT_FOUND: &str = "API003";
pub const API_PERMISSION_DENIED: &str = "API007";
pub const API_PUBLIC_CREDITS_CONFLICT: &str = "API013";

// Endpoints
pub const END_NOT_FOUND: &str = "END003";

// Subscriptions
pub const SUB_NOT_FOUND: &str = "SUB005";

// Security policy
pub const SEC_INVALID_IP: &str = "SEC003";

// Credits
pub const CRD_GROUP_NAME_REQUIRED: &str = "CRD009";
pub const CRD_API_KEY_REQUIRED: &str = "CRD010";
pub const CRD_USER_NOT_FOUND: &str = "CRD017";
pub const CRD_INSUFFICIENT_CREDITS: &str = "CRD019";

// Gateway plane
pub const GTW_UPSTREAM_ERROR: &str = "GTW001";
pub const GTW_TIMEOUT: &str = "GTW002";
pub const GTW_NO_AVAILABLE_SERVERS: &str = "GTW003";
pub const GTW_INVALID_REQUEST: &str = "GTW004";
pub const GTW_RATE_LIMIT_EXCEEDED: &str = "GTW005";
pub const GTW_SERVICE_UNAVAILABLE: &str = "GTW006";
pub const GTW_AUTHENTICATION_REQUIRED: &str = "GTW007";
pub const GTW_SUBSCRIPTION_REQUIRED: &str = "GTW008";
pub const GTW_CIRCUIT_BREAKER_OPEN: &str = "GTW010";
pub const GTW_INVALID_ENDPOINT: &str = "GTW011";
pub const GTW_PROTO_DECODE_ERROR: &str = "GTW013";
pub const GTW_UNEXPECTED_ERROR: &str = "GTW999";

// Request validation
pub const REQ_BODY_TOO_LARGE: &str = "REQ001";
pub const VAL_INVALID_JSON: &str = "VAL001";
pub const GEN_INVALID_REQUEST: &str = "GEN001";
pub const GEN_VALIDATION_ERROR: &str = "GEN002";

// Rate limiting (IP pre-auth layer)
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

// Internal
pub const ISE_INTERNAL_ERROR: &str = "ISE001";
