//! Credential context: acquiring and releasing the identity a command runs as
//!
//! An [`Authenticator`] turns a user name, password and domain into an
//! [`Identity`]. The identity is held by an [`IdentityGuard`] for the rest of
//! the run and released exactly once, on the normal path, on failure and
//! during unwinding.

use std::env;
use std::process::Command;

use crate::errors::RunAsError;
use crate::secret::SecretString;

/// A resolved, authenticated security context
pub trait Identity {
    /// Account name for diagnostics, `DOMAIN\user` or `user`
    fn account(&self) -> String;

    /// Release the underlying OS resources
    ///
    /// Calling this more than once must be harmless.
    fn release(&mut self);
}

/// Obtains identities from credentials
pub trait Authenticator {
    type Identity: Identity;

    /// Log on as `user`. Never retries.
    fn acquire(
        &self,
        user: &str,
        password: &SecretString,
        domain: Option<&str>,
    ) -> Result<Self::Identity, RunAsError>;
}

/// Owns an identity and releases it once
pub struct IdentityGuard<I: Identity> {
    identity: Option<I>,
}

impl<I: Identity> IdentityGuard<I> {
    pub fn new(identity: I) -> Self {
        Self {
            identity: Some(identity),
        }
    }

    pub fn identity(&self) -> Option<&I> {
        self.identity.as_ref()
    }

    /// Release the identity now. Returns whether anything was released.
    pub fn release(&mut self) -> bool {
        match self.identity.take() {
            Some(mut identity) => {
                tracing::debug!(account = %identity.account(), "releasing identity");
                identity.release();
                true
            }
            None => false,
        }
    }
}

impl<I: Identity> Drop for IdentityGuard<I> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Get the current user's username
pub fn current_user() -> String {
    // Try whoami command
    if let Ok(output) = Command::new("whoami").output() {
        if output.status.success() {
            let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !name.is_empty() {
                return name;
            }
        }
    }

    // Fallback to environment variables
    env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Join a user and an optional domain as `DOMAIN\user`
pub fn qualified_account(user: &str, domain: Option<&str>) -> String {
    match domain {
        Some(domain) => format!("{}\\{}", domain, user),
        None => user.to_string(),
    }
}

pub use platform::{SystemAuthenticator, SystemIdentity};

#[cfg(windows)]
mod platform {
    use super::*;
    use crate::win32::{self, Handle};

    /// A logon token obtained with `LogonUserW`
    pub struct SystemIdentity {
        pub(crate) user: String,
        pub(crate) domain: Option<String>,
        /// Kept for the `CreateProcessWithLogonW` fallback
        pub(crate) password: SecretString,
        pub(crate) token: Option<Handle>,
    }

    impl SystemIdentity {
        pub(crate) fn token(&self) -> Option<&Handle> {
            self.token.as_ref()
        }
    }

    impl Identity for SystemIdentity {
        fn account(&self) -> String {
            qualified_account(&self.user, self.domain.as_deref())
        }

        fn release(&mut self) {
            // Dropping the handle closes the token
            self.token.take();
            self.password = SecretString::default();
        }
    }

    #[derive(Debug, Default, Clone, Copy)]
    pub struct SystemAuthenticator;

    impl Authenticator for SystemAuthenticator {
        type Identity = SystemIdentity;

        fn acquire(
            &self,
            user: &str,
            password: &SecretString,
            domain: Option<&str>,
        ) -> Result<SystemIdentity, RunAsError> {
            let account = qualified_account(user, domain);
            let token = win32::logon_user(user, domain, password)
                .map_err(|e| RunAsError::authentication(&account, e))?;
            tracing::debug!(%account, "logon token acquired");

            Ok(SystemIdentity {
                user: user.to_string(),
                domain: domain.map(String::from),
                password: password.clone(),
                token: Some(token),
            })
        }
    }
}

#[cfg(unix)]
mod platform {
    use super::*;
    use crate::unix_account::{self, Account};

    /// A looked-up account the child can be switched to
    pub struct SystemIdentity {
        pub(crate) account: Account,
        /// Supplementary groups when switching to another account
        pub(crate) switch_groups: Option<Vec<libc::gid_t>>,
        pub(crate) released: bool,
    }

    impl SystemIdentity {
        pub(crate) fn target(&self) -> Option<&Account> {
            if self.released {
                None
            } else {
                Some(&self.account)
            }
        }
    }

    impl Identity for SystemIdentity {
        fn account(&self) -> String {
            self.account.name.clone()
        }

        fn release(&mut self) {
            self.released = true;
            self.switch_groups = None;
        }
    }

    /// Resolves accounts from the system account database
    ///
    /// The invoking account is accepted as is. Any other account requires
    /// running as root.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SystemAuthenticator;

    impl Authenticator for SystemAuthenticator {
        type Identity = SystemIdentity;

        fn acquire(
            &self,
            user: &str,
            _password: &SecretString,
            domain: Option<&str>,
        ) -> Result<SystemIdentity, RunAsError> {
            let shown = qualified_account(user, domain);
            if domain.is_some() {
                tracing::debug!(account = %shown, "domain is ignored for local accounts");
            }

            let account = unix_account::lookup(user)
                .map_err(|e| RunAsError::authentication(&shown, e))?
                .ok_or_else(|| RunAsError::authentication(&shown, "unknown user name"))?;

            let euid = unix_account::effective_uid();
            if account.uid == euid {
                tracing::debug!(uid = euid, "running as the invoking account");
                return Ok(SystemIdentity {
                    account,
                    switch_groups: None,
                    released: false,
                });
            }

            if euid != 0 {
                return Err(RunAsError::authentication(
                    &shown,
                    "switching to another account requires root privileges",
                ));
            }

            let groups = unix_account::supplementary_groups(&account)
                .map_err(|e| RunAsError::authentication(&shown, e))?;
            tracing::debug!(uid = account.uid, gid = account.gid, "switching account");

            Ok(SystemIdentity {
                account,
                switch_groups: Some(groups),
                released: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingIdentity {
        releases: Rc<Cell<u32>>,
    }

    impl Identity for CountingIdentity {
        fn account(&self) -> String {
            "bob".to_string()
        }

        fn release(&mut self) {
            self.releases.set(self.releases.get() + 1);
        }
    }

    #[test]
    fn test_guard_releases_once() {
        let releases = Rc::new(Cell::new(0));
        let mut guard = IdentityGuard::new(CountingIdentity {
            releases: releases.clone(),
        });
        assert!(guard.identity().is_some());
        assert!(guard.release());
        assert!(!guard.release());
        drop(guard);
        assert_eq!(releases.get(), 1);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let releases = Rc::new(Cell::new(0));
        {
            let _guard = IdentityGuard::new(CountingIdentity {
                releases: releases.clone(),
            });
        }
        assert_eq!(releases.get(), 1);
    }

    #[test]
    fn test_qualified_account() {
        assert_eq!(qualified_account("bob", Some("CORP")), "CORP\\bob");
        assert_eq!(qualified_account("bob", None), "bob");
    }

    #[test]
    fn test_current_user_is_not_empty() {
        assert!(!current_user().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_unknown_user_is_an_authentication_error() {
        let err = SystemAuthenticator
            .acquire("SomeAsTestUser", &SecretString::new("SomePassword"), None)
            .err()
            .expect("unknown account must be rejected");
        assert_eq!(err.kind(), crate::errors::ErrorKind::Authentication);
        assert!(err.to_string().contains("SomeAsTestUser"));
        assert!(!err.to_string().contains("SomePassword"));
    }

    #[cfg(unix)]
    #[test]
    fn test_domain_is_named_in_unix_errors() {
        let err = SystemAuthenticator
            .acquire("SomeAsTestUser", &SecretString::new("pw"), Some("CORP"))
            .err()
            .expect("unknown account must be rejected");
        assert!(err.to_string().contains("CORP\\SomeAsTestUser"));
    }

    #[cfg(unix)]
    #[test]
    fn test_invoking_account_is_accepted() {
        let me = crate::unix_account::lookup(&current_user()).unwrap();
        if let Some(me) = me {
            let mut identity = SystemAuthenticator
                .acquire(&me.name, &SecretString::new("ignored"), None)
                .unwrap();
            assert_eq!(identity.account(), me.name);
            assert!(identity.target().is_some());
            identity.release();
            identity.release();
            assert!(identity.target().is_none());
        }
    }
}
