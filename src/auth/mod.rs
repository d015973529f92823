//! Authorization: attaching credentials to requests and refreshing them.

mod anonymous;
mod authorizer;
mod domain;
mod oauth2;

pub use anonymous::AnonymousAuthorizer;
pub use authorizer::Authorizer;
pub use domain::{domains, AuthorizationDomain, ServiceKind};
pub use oauth2::{OAuth2Authorizer, OAuth2Config, DEFAULT_TOKEN_URI};
