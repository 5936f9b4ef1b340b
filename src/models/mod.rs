mod account;
pub mod auth;

pub use account::{Account, PoolDocument, POOL_DOCUMENT_VERSION};
pub use auth::{compose_refresh_parts, parse_refresh_parts, AuthRecord, RefreshParts};
