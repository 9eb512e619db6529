//! Talking to Google: OAuth client credentials, scopes, the authorization engine, identity
//! verification and the local servers that receive redirects.

mod authorize;
mod callback;
mod files;
mod identity;
mod manage;
mod oauth;
mod scopes;

pub use authorize::{AuthorizationRequest, Authorizer, Flow, DEFAULT_AUTHORIZE_TIMEOUT};
pub use callback::CallbackServer;
pub use files::ClientCredentials;
pub use identity::{
    fetch_authorized_email, same_email, GoogleIdentityVerifier, IdentityVerifier,
    IDENTITY_TIMEOUT,
};
pub use manage::{AccountEntry, AccountsView, ManageServer, StopReason, DEFAULT_MANAGE_TIMEOUT};
pub use oauth::{
    code_from_query, code_from_redirect_url, Exchange, GoogleOAuthClient, OAuthClient,
    PendingAuthorization, CALLBACK_PATH, MANUAL_REDIRECT_URI,
};
pub use scopes::{
    parse_services, scopes_for, services_info, DriveScope, ScopeOptions, Service, ServiceInfo,
    IDENTITY_SCOPES,
};
