pub mod analytics;
pub mod api;
pub mod audit;
pub mod claims;
pub mod codes;
pub mod credit;
pub mod endpoint;
pub mod envelope;
pub mod group;
pub mod role;
pub mod routing;
pub mod subscription;
pub mod tier;
pub mod transform;
pub mod user;
pub mod validation;
pub mod vault;
pub mod window;

pub use analytics::{
    AnalyticsGranularity, AnalyticsQuery, AnalyticsSnapshot, SeriesPoint, TopEntry,
};
pub use api::{Api, ApiType, IpMode, RotationPhase};
pub use audit::AuditEvent;
pub use claims::{AuthClaims, TokenType};
pub use credit::{CreditDefinition, CreditTier, ResetFrequency, UserCreditEntry, UserCredits};
pub use endpoint::{Endpoint, SoapPasswordType, SoapSecurity};
pub use envelope::{ErrorBody, StrictEnvelope};
pub use group::{Group, ALL_GROUP};
pub use role::{Role, ADMIN_ROLE};
pub use routing::Routing;
pub use subscription::Subscription;
pub use tier::Tier;
pub use transform::{
    BodyTransforms, HeaderTransforms, QueryTransforms, RequestTransforms, ResponseTransforms,
    TransformConfig, TransformConfigError,
};
pub use user::User;
pub use validation::{FieldFormat, FieldRule, FieldType, ValidationSchema};
pub use vault::VaultEntry;
pub use window::WindowUnit;
