//! Authorization domains.
//!
//! A domain names the scope of access an authorizer has been granted for a
//! service, e.g. `("cl", "https://www.google.com/calendar/feeds/")`. Domains
//! are interned for the lifetime of the process and compared by identity.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use parking_lot::Mutex;

struct DomainData {
    service_name: String,
    scope: String,
}

/// An interned `(service name, scope URI)` pair.
///
/// Copies are cheap and compare equal only when they come from the same
/// [`AuthorizationDomain::get`] key.
#[derive(Clone, Copy)]
pub struct AuthorizationDomain(&'static DomainData);

type Registry = Mutex<HashMap<(String, String), &'static DomainData>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

impl AuthorizationDomain {
    /// Return the domain for `(service_name, scope)`, creating it on first use.
    #[must_use]
    pub fn get(service_name: &str, scope: &str) -> Self {
        let mut domains = registry().lock();
        let key = (service_name.to_owned(), scope.to_owned());
        if let Some(data) = domains.get(&key) {
            return Self(*data);
        }
        // Domains are never destroyed.
        let data: &'static DomainData = Box::leak(Box::new(DomainData {
            service_name: service_name.to_owned(),
            scope: scope.to_owned(),
        }));
        domains.insert(key, data);
        Self(data)
    }

    #[must_use]
    pub fn service_name(&self) -> &'static str {
        let data: &'static DomainData = self.0;
        &data.service_name
    }

    /// Root URI of the access scope.
    #[must_use]
    pub fn scope(&self) -> &'static str {
        let data: &'static DomainData = self.0;
        &data.scope
    }
}

impl PartialEq for AuthorizationDomain {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl Eq for AuthorizationDomain {}

impl Hash for AuthorizationDomain {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(self.0, state);
    }
}

impl fmt::Debug for AuthorizationDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationDomain")
            .field("service_name", &self.service_name())
            .field("scope", &self.scope())
            .finish()
    }
}

/// Services with a known set of authorization domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Calendar,
    Contacts,
    Documents,
    Freebase,
    PicasaWeb,
    Tasks,
    YouTube,
}

/// The domains of the Google services.
pub mod domains {
    use super::{AuthorizationDomain, ServiceKind};

    #[must_use]
    pub fn calendar() -> AuthorizationDomain {
        AuthorizationDomain::get("cl", "https://www.google.com/calendar/feeds/")
    }

    #[must_use]
    pub fn contacts() -> AuthorizationDomain {
        AuthorizationDomain::get("cp", "https://www.google.com/m8/feeds/")
    }

    #[must_use]
    pub fn documents() -> AuthorizationDomain {
        AuthorizationDomain::get("writely", "https://www.googleapis.com/auth/drive")
    }

    #[must_use]
    pub fn spreadsheets() -> AuthorizationDomain {
        AuthorizationDomain::get("wise", "https://spreadsheets.google.com/feeds/")
    }

    #[must_use]
    pub fn freebase() -> AuthorizationDomain {
        AuthorizationDomain::get("freebase", "https://www.googleapis.com/auth/freebase")
    }

    #[must_use]
    pub fn picasaweb() -> AuthorizationDomain {
        AuthorizationDomain::get("lh2", "http://picasaweb.google.com/data/")
    }

    #[must_use]
    pub fn tasks() -> AuthorizationDomain {
        AuthorizationDomain::get("tasks", "https://www.googleapis.com/auth/tasks")
    }

    #[must_use]
    pub fn youtube() -> AuthorizationDomain {
        AuthorizationDomain::get("youtube", "http://gdata.youtube.com")
    }

    /// Every domain a service's requests may fall under, so one token can
    /// enable the whole service.
    #[must_use]
    pub fn for_service(kind: ServiceKind) -> Vec<AuthorizationDomain> {
        match kind {
            ServiceKind::Calendar => vec![calendar()],
            ServiceKind::Contacts => vec![contacts()],
            // Document exports and uploads go through the spreadsheets scope too.
            ServiceKind::Documents => vec![documents(), spreadsheets()],
            ServiceKind::Freebase => vec![freebase()],
            ServiceKind::PicasaWeb => vec![picasaweb()],
            ServiceKind::Tasks => vec![tasks()],
            ServiceKind::YouTube => vec![youtube()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_domains_are_interned() {
        let a = AuthorizationDomain::get("svc", "https://example/scope");
        let b = AuthorizationDomain::get("svc", "https://example/scope");
        assert_eq!(a, b);
        assert!(std::ptr::eq(a.scope(), b.scope()));
    }

    #[test]
    fn test_distinct_keys_differ() {
        let a = AuthorizationDomain::get("svc", "https://example/one");
        let b = AuthorizationDomain::get("svc", "https://example/two");
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_set_membership() {
        let set: HashSet<_> = domains::for_service(ServiceKind::Documents)
            .into_iter()
            .collect();
        assert!(set.contains(&domains::spreadsheets()));
        assert!(!set.contains(&domains::tasks()));
    }

    #[test]
    fn test_concurrent_get_yields_one_instance() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| AuthorizationDomain::get("race", "https://example/race")))
            .collect();
        let domains: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(domains.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_debug_shows_names() {
        let debug = format!("{:?}", domains::calendar());
        assert!(debug.contains("cl"));
    }
}
