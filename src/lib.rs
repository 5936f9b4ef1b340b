pub mod constants;
pub mod error;
mod models;
mod modules;
mod provider;
mod proxy;
#[cfg(test)]
mod test_utils;
mod utils;

pub use error::{AppError, AppResult};
pub use models::auth::{
    compose_refresh_parts, parse_refresh_parts, AuthRecord, RefreshParts,
};
pub use modules::auth::flow::{login_flow, EnrollmentReport};
pub use modules::auth::oauth::{ExchangeSuccess, OauthClient, RefreshError};
pub use modules::system::logger::init_logger;
pub use provider::{
    create_provider, AuthMethodDescriptor, AuthMethodKind, Authorization, AuthorizeMethod,
    CredentialHost, Loader, NoopCredentialHost, Provider,
};
pub use proxy::pool::{AccountPool, SharedPool};
pub use proxy::{HostBody, HostRequest, HostResponse};
