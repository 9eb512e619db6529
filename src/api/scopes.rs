//! Google services and the OAuth scopes each of them needs.

use crate::error::AuthError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Scopes that are always requested so that the identity of the token can be verified.
pub const IDENTITY_SCOPES: &[&str] = &[
    "openid",
    "email",
    "https://www.googleapis.com/auth/userinfo.email",
];

const SCOPE_PREFIX: &str = "https://www.googleapis.com/auth/";

/// A Google Workspace service that can be authorized.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Gmail,
    Calendar,
    Chat,
    Classroom,
    Drive,
    Docs,
    Slides,
    Contacts,
    Tasks,
    Sheets,
    People,
    Forms,
    Appscript,
    Groups,
    Keep,
}

serde_plain::derive_display_from_serialize!(Service);
serde_plain::derive_fromstr_from_deserialize!(Service);

impl Service {
    pub const ALL: [Service; 15] = [
        Service::Gmail,
        Service::Calendar,
        Service::Chat,
        Service::Classroom,
        Service::Drive,
        Service::Docs,
        Service::Slides,
        Service::Contacts,
        Service::Tasks,
        Service::Sheets,
        Service::People,
        Service::Forms,
        Service::Appscript,
        Service::Groups,
        Service::Keep,
    ];

    /// Whether a regular (non-admin) user can authorize this service with OAuth.
    pub fn is_user_service(&self) -> bool {
        !matches!(self, Service::Groups | Service::Keep)
    }

    /// The services selected by `--services user` (the default) or `--services all`.
    pub fn user_services() -> Vec<Service> {
        Self::ALL
            .into_iter()
            .filter(Service::is_user_service)
            .collect()
    }

    /// The Google APIs this service uses.
    pub fn apis(&self) -> &'static [&'static str] {
        match self {
            Service::Gmail => &["gmail"],
            Service::Calendar => &["calendar"],
            Service::Chat => &["chat"],
            Service::Classroom => &["classroom"],
            Service::Drive => &["drive"],
            Service::Docs => &["docs", "drive"],
            Service::Slides => &["slides", "drive"],
            Service::Contacts => &["people"],
            Service::Tasks => &["tasks"],
            Service::Sheets => &["sheets", "drive"],
            Service::People => &["people"],
            Service::Forms => &["forms"],
            Service::Appscript => &["script"],
            Service::Groups => &["cloudidentity"],
            Service::Keep => &["keep"],
        }
    }

    pub fn note(&self) -> &'static str {
        match self {
            Service::Groups => "Workspace only",
            Service::Keep => "Workspace only; service account (domain-wide delegation)",
            Service::Docs | Service::Slides | Service::Sheets => "Export uses the Drive scope",
            _ => "",
        }
    }

    /// Scope suffixes (after `https://www.googleapis.com/auth/`) for full or read-only access,
    /// not including Drive, which depends on the Drive scope mode.
    fn scope_suffixes(&self, readonly: bool) -> &'static [&'static str] {
        match (self, readonly) {
            (Service::Gmail, false) => &[
                "gmail.modify",
                "gmail.settings.basic",
                "gmail.settings.sharing",
            ],
            (Service::Gmail, true) => &["gmail.readonly"],
            (Service::Calendar, false) => &["calendar"],
            (Service::Calendar, true) => &["calendar.readonly"],
            (Service::Chat, false) => &["chat.spaces", "chat.messages", "chat.memberships"],
            (Service::Chat, true) => &[
                "chat.spaces.readonly",
                "chat.messages.readonly",
                "chat.memberships.readonly",
            ],
            (Service::Classroom, false) => &[
                "classroom.courses",
                "classroom.rosters",
                "classroom.coursework.students",
            ],
            (Service::Classroom, true) => &[
                "classroom.courses.readonly",
                "classroom.rosters.readonly",
                "classroom.coursework.students.readonly",
            ],
            (Service::Drive, _) => &[],
            (Service::Docs, false) => &["documents"],
            (Service::Docs, true) => &["documents.readonly"],
            (Service::Slides, false) => &["presentations"],
            (Service::Slides, true) => &["presentations.readonly"],
            (Service::Contacts, false) => &[
                "contacts",
                "contacts.other.readonly",
                "directory.readonly",
            ],
            (Service::Contacts, true) => &[
                "contacts.readonly",
                "contacts.other.readonly",
                "directory.readonly",
            ],
            (Service::Tasks, false) => &["tasks"],
            (Service::Tasks, true) => &["tasks.readonly"],
            (Service::Sheets, false) => &["spreadsheets"],
            (Service::Sheets, true) => &["spreadsheets.readonly"],
            (Service::People, _) => &["userinfo.profile"],
            (Service::Forms, false) => &["forms.body", "forms.responses.readonly"],
            (Service::Forms, true) => &["forms.body.readonly", "forms.responses.readonly"],
            (Service::Appscript, false) => &["script.projects", "script.deployments"],
            (Service::Appscript, true) => &[
                "script.projects.readonly",
                "script.deployments.readonly",
            ],
            (Service::Groups, _) => &["cloud-identity.groups.readonly"],
            (Service::Keep, false) => &["keep"],
            (Service::Keep, true) => &["keep.readonly"],
        }
    }

    /// Whether this service also needs the Drive scope.
    fn uses_drive(&self) -> bool {
        matches!(
            self,
            Service::Drive | Service::Docs | Service::Slides | Service::Sheets
        )
    }
}

/// How much of Drive to request.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum DriveScope {
    /// All files.
    #[default]
    Full,
    /// All files, read only.
    Readonly,
    /// Only files created or opened by this app (write-capable).
    File,
}

serde_plain::derive_display_from_serialize!(DriveScope);
serde_plain::derive_fromstr_from_deserialize!(DriveScope);

impl DriveScope {
    fn suffix(&self) -> &'static str {
        match self {
            DriveScope::Full => "drive",
            DriveScope::Readonly => "drive.readonly",
            DriveScope::File => "drive.file",
        }
    }
}

/// Options that modify which scopes are requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeOptions {
    pub readonly: bool,
    pub drive_scope: DriveScope,
}

impl ScopeOptions {
    /// Rejects contradictory combinations.
    ///
    /// # Errors
    /// Returns `AuthError::ScopeConflict` for `readonly` with `DriveScope::File`.
    pub fn validate(&self) -> Result<()> {
        if self.readonly && self.drive_scope == DriveScope::File {
            return Err(AuthError::ScopeConflict.into());
        }
        Ok(())
    }
}

/// Computes the sorted, de-duplicated scopes for `services`, including the identity scopes.
///
/// # Errors
/// Returns `AuthError::ScopeConflict` if `options` are contradictory, whatever the services.
pub fn scopes_for(services: &[Service], options: ScopeOptions) -> Result<Vec<String>> {
    options.validate()?;
    let drive = if options.readonly {
        DriveScope::Readonly
    } else {
        options.drive_scope
    };
    let mut scopes: BTreeSet<String> = IDENTITY_SCOPES.iter().map(|s| s.to_string()).collect();
    for service in services {
        for suffix in service.scope_suffixes(options.readonly) {
            scopes.insert(format!("{SCOPE_PREFIX}{suffix}"));
        }
        if service.uses_drive() {
            scopes.insert(format!("{SCOPE_PREFIX}{}", drive.suffix()));
        }
    }
    Ok(scopes.into_iter().collect())
}

/// Parses a `--services` value: `user`, `all` (or empty) for every user service, otherwise a
/// comma-separated list. Keep is rejected because it needs a service account.
pub fn parse_services(csv: &str) -> Result<Vec<Service>> {
    let trimmed = csv.trim().to_lowercase();
    if trimmed.is_empty() || trimmed == "user" || trimmed == "all" {
        return Ok(Service::user_services());
    }
    let mut out: Vec<Service> = Vec::new();
    for part in trimmed.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let service: Service = part.parse().map_err(|_| {
            AuthError::validation(format!(
                "unknown service '{part}', expected one of: {}",
                Service::ALL
                    .iter()
                    .map(Service::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;
        if service == Service::Keep {
            return Err(AuthError::validation(
                "Keep auth is Workspace-only and requires a service account. Use: gog auth keep \
                <email> --key <service-account.json>",
            )
            .into());
        }
        if !out.contains(&service) {
            out.push(service);
        }
    }
    if out.is_empty() {
        return Err(AuthError::validation("no services selected").into());
    }
    Ok(out)
}

/// A row of `gog auth services`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    service: Service,
    user: bool,
    apis: Vec<String>,
    scopes: Vec<String>,
    note: String,
}

/// Describes every service and its full-access scopes.
pub fn services_info() -> Vec<ServiceInfo> {
    Service::ALL
        .iter()
        .map(|service| {
            let mut scopes: Vec<String> = service
                .scope_suffixes(false)
                .iter()
                .map(|s| format!("{SCOPE_PREFIX}{s}"))
                .collect();
            if service.uses_drive() {
                scopes.push(format!("{SCOPE_PREFIX}{}", DriveScope::Full.suffix()));
            }
            ServiceInfo {
                service: *service,
                user: service.is_user_service(),
                apis: service.apis().iter().map(|s| s.to_string()).collect(),
                scopes,
                note: service.note().to_string(),
            }
        })
        .collect()
}

impl ServiceInfo {
    pub fn service(&self) -> Service {
        self.service
    }

    pub fn user(&self) -> bool {
        self.user
    }

    pub fn apis(&self) -> &[String] {
        &self.apis
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn note(&self) -> &str {
        &self.note
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::auth_error;

    fn scope(suffix: &str) -> String {
        format!("{SCOPE_PREFIX}{suffix}")
    }

    #[test]
    fn test_readonly_with_drive_file_always_conflicts() {
        let options = ScopeOptions {
            readonly: true,
            drive_scope: DriveScope::File,
        };
        for services in [vec![], vec![Service::Gmail], Service::user_services()] {
            let err = scopes_for(&services, options).unwrap_err();
            assert!(matches!(auth_error(&err), Some(AuthError::ScopeConflict)));
        }
    }

    #[test]
    fn test_identity_scopes_always_present() {
        let scopes = scopes_for(&[], ScopeOptions::default()).unwrap();
        assert_eq!(
            vec![
                "email".to_string(),
                "https://www.googleapis.com/auth/userinfo.email".to_string(),
                "openid".to_string(),
            ],
            scopes
        );
    }

    #[test]
    fn test_union_is_deduplicated() {
        let scopes = scopes_for(
            &[Service::Docs, Service::Sheets, Service::Drive],
            ScopeOptions::default(),
        )
        .unwrap();
        let drive: Vec<_> = scopes.iter().filter(|s| **s == scope("drive")).collect();
        assert_eq!(1, drive.len());
        assert!(scopes.contains(&scope("documents")));
        assert!(scopes.contains(&scope("spreadsheets")));
        let mut sorted = scopes.clone();
        sorted.sort();
        assert_eq!(sorted, scopes);
    }

    #[test]
    fn test_readonly_scopes() {
        let scopes = scopes_for(
            &[Service::Gmail, Service::Drive],
            ScopeOptions {
                readonly: true,
                drive_scope: DriveScope::Full,
            },
        )
        .unwrap();
        assert!(scopes.contains(&scope("gmail.readonly")));
        assert!(scopes.contains(&scope("drive.readonly")));
        assert!(!scopes.contains(&scope("gmail.modify")));
        assert!(!scopes.contains(&scope("drive")));
    }

    #[test]
    fn test_drive_file_mode() {
        let scopes = scopes_for(
            &[Service::Drive],
            ScopeOptions {
                readonly: false,
                drive_scope: DriveScope::File,
            },
        )
        .unwrap();
        assert!(scopes.contains(&scope("drive.file")));
        assert!(!scopes.contains(&scope("drive")));
    }

    #[test]
    fn test_parse_services() {
        assert_eq!(Service::user_services(), parse_services("").unwrap());
        assert_eq!(Service::user_services(), parse_services(" ALL ").unwrap());
        assert!(!Service::user_services().contains(&Service::Keep));
        assert_eq!(
            vec![Service::Gmail, Service::Drive],
            parse_services("gmail, Drive,gmail").unwrap()
        );

        for bad in ["gmail,nope", "keep", " , "] {
            let err = parse_services(bad).unwrap_err();
            assert!(matches!(auth_error(&err), Some(AuthError::Validation(_))), "{bad}");
        }
    }

    #[test]
    fn test_services_info() {
        let infos = services_info();
        assert_eq!(Service::ALL.len(), infos.len());
        let keep = infos.iter().find(|i| i.service() == Service::Keep).unwrap();
        assert!(!keep.user());
        assert_eq!(vec![scope("keep")], keep.scopes());
    }
}
