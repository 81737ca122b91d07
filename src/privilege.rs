use core::ops::BitOr;
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Privilege needed to query and impersonate the token of another session's user.
pub const DELEGATE_SESSION_USER_IMPERSONATE: &str = "SeDelegateSessionUserImpersonatePrivilege";

/// `SE_PRIVILEGE_*` attribute flags of one privilege in a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct PrivilegeAttributes(pub u32);

impl PrivilegeAttributes {
    /// No flag set: present in the token but disabled.
    pub const Disabled: PrivilegeAttributes = PrivilegeAttributes(0x0000_0000);

    pub const EnabledByDefault: PrivilegeAttributes = PrivilegeAttributes(0x0000_0001);

    pub const Enabled: PrivilegeAttributes = PrivilegeAttributes(0x0000_0002);

    pub const Removed: PrivilegeAttributes = PrivilegeAttributes(0x0000_0004);

    pub const UsedForAccess: PrivilegeAttributes = PrivilegeAttributes(0x8000_0000);

    /// Checks if every bit of `other` is set in `self`.
    pub fn contains(self, other: PrivilegeAttributes) -> bool {
        (self.0 & other.0) == other.0
    }

    /// A privilege counts as held unless it is disabled or removed.
    pub fn is_usable(self) -> bool {
        self != PrivilegeAttributes::Disabled && !self.contains(PrivilegeAttributes::Removed)
    }
}

impl BitOr for PrivilegeAttributes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        PrivilegeAttributes(self.0 | rhs.0)
    }
}

/// Snapshot of the privileges in a token, keyed by privilege name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivilegeSet {
    privileges: HashMap<String, PrivilegeAttributes>,
}

impl PrivilegeSet {
    /// Builds a set from `(name, attributes)` pairs.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, PrivilegeAttributes)>,
        S: Into<String>,
    {
        Self {
            privileges: entries.into_iter().map(|(name, attrs)| (name.into(), attrs)).collect(),
        }
    }

    /// Attributes of `name`; privilege names compare case-insensitively.
    pub fn attributes(&self, name: &str) -> Option<PrivilegeAttributes> {
        self.privileges
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
            .map(|(_, attrs)| *attrs)
    }

    /// `true` if `name` is present and neither disabled nor removed.
    pub fn has(&self, name: &str) -> bool {
        self.attributes(name).is_some_and(PrivilegeAttributes::is_usable)
    }

    /// Fails with [`Error::MissingPrivilege`] unless [`PrivilegeSet::has`] holds.
    pub fn require(&self, name: &str) -> Result<()> {
        if self.has(name) {
            Ok(())
        } else {
            Err(Error::MissingPrivilege(name.to_owned()))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, PrivilegeAttributes)> {
        self.privileges.iter().map(|(name, attrs)| (name.as_str(), *attrs))
    }

    pub fn len(&self) -> usize {
        self.privileges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.privileges.is_empty()
    }
}

#[cfg(windows)]
pub use self::gate::*;

#[cfg(windows)]
mod gate {
    use super::{PrivilegeAttributes, PrivilegeSet};
    use crate::{
        error::{last_error, Error, Result},
        handle::KernelHandle,
        token::token_information,
    };
    use core::ptr::{null, null_mut};
    use windows_sys::Win32::{
        Foundation::{ERROR_INSUFFICIENT_BUFFER, FALSE, LUID},
        Security::{
            LookupPrivilegeNameW, TokenPrivileges, LUID_AND_ATTRIBUTES, TOKEN_PRIVILEGES, TOKEN_QUERY,
        },
        System::Threading::{GetCurrentProcess, OpenProcessToken},
    };

    impl PrivilegeSet {
        /// Reads the privileges of the calling process's own token.
        ///
        /// Never cached: the caller's privilege state can change between calls.
        pub fn current() -> Result<Self> {
            let mut raw = null_mut();
            if unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut raw) } == FALSE {
                return Err(Error::PrivilegeQueryFailed(last_error()));
            }

            let token = unsafe { KernelHandle::from_raw(raw) };
            let buffer = token_information(&token, TokenPrivileges).map_err(Error::PrivilegeQueryFailed)?;

            let pinned = buffer.pin();
            let entries = unsafe {
                let header = pinned.as_ptr::<TOKEN_PRIVILEGES>();
                core::slice::from_raw_parts(
                    (*header).Privileges.as_ptr() as *const LUID_AND_ATTRIBUTES,
                    (*header).PrivilegeCount as usize,
                )
            };

            let set = PrivilegeSet::from_entries(entries.iter().filter_map(|entry| {
                match privilege_name(&entry.Luid) {
                    Some(name) => Some((name, PrivilegeAttributes(entry.Attributes))),
                    None => {
                        tracing::warn!(
                            luid_low = entry.Luid.LowPart,
                            luid_high = entry.Luid.HighPart,
                            "could not resolve privilege name"
                        );
                        None
                    }
                }
            }));

            tracing::debug!(count = set.len(), "read current process privileges");
            Ok(set)
        }
    }

    /// Checks if the calling process holds `name` (present and not disabled).
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// if has_privilege("SeTcbPrivilege")? {
    ///     println!("running with TCB");
    /// }
    /// ```
    pub fn has_privilege(name: &str) -> Result<bool> {
        Ok(PrivilegeSet::current()?.has(name))
    }

    /// Fails fast with [`Error::MissingPrivilege`] if the caller lacks `name`.
    pub fn require_privilege(name: &str) -> Result<()> {
        PrivilegeSet::current()?.require(name)
    }

    fn privilege_name(luid: &LUID) -> Option<String> {
        // Probe for the length, then fetch.
        let mut len = 0u32;
        if unsafe { LookupPrivilegeNameW(null(), luid, null_mut(), &mut len) } == FALSE
            && last_error() != ERROR_INSUFFICIENT_BUFFER
        {
            return None;
        }

        let mut buffer = vec![0u16; len as usize + 1];
        let mut len = buffer.len() as u32;
        if unsafe { LookupPrivilegeNameW(null(), luid, buffer.as_mut_ptr(), &mut len) } == FALSE {
            return None;
        }

        buffer.truncate(len as usize);
        Some(String::from_utf16_lossy(&buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system_like() -> PrivilegeSet {
        PrivilegeSet::from_entries([
            ("SeTcbPrivilege", PrivilegeAttributes::Enabled | PrivilegeAttributes::EnabledByDefault),
            (DELEGATE_SESSION_USER_IMPERSONATE, PrivilegeAttributes::Enabled),
            ("SeShutdownPrivilege", PrivilegeAttributes::Disabled),
            ("SeDebugPrivilege", PrivilegeAttributes::Removed),
            ("SeChangeNotifyPrivilege", PrivilegeAttributes::EnabledByDefault),
        ])
    }

    #[test]
    fn enabled_privileges_are_held() {
        let set = system_like();
        assert!(set.has("SeTcbPrivilege"));
        assert!(set.has(DELEGATE_SESSION_USER_IMPERSONATE));
        assert!(set.has("SeChangeNotifyPrivilege"));
        assert!(set.require(DELEGATE_SESSION_USER_IMPERSONATE).is_ok());
    }

    #[test]
    fn disabled_or_removed_privileges_are_not_held() {
        let set = system_like();
        assert!(!set.has("SeShutdownPrivilege"));
        assert!(!set.has("SeDebugPrivilege"));
        assert_eq!(
            set.require("SeShutdownPrivilege"),
            Err(Error::MissingPrivilege("SeShutdownPrivilege".into()))
        );
    }

    #[test]
    fn nonexistent_privilege_always_fails() {
        let name = "SeNonexistentTestOnlyPrivilege";
        for set in [PrivilegeSet::default(), system_like()] {
            assert_eq!(set.require(name), Err(Error::MissingPrivilege(name.into())));
        }
    }

    #[test]
    fn names_compare_case_insensitively() {
        let set = system_like();
        assert!(set.has("setcbprivilege"));
        assert_eq!(
            set.attributes("SETCBPRIVILEGE"),
            Some(PrivilegeAttributes::Enabled | PrivilegeAttributes::EnabledByDefault)
        );
    }

    #[test]
    fn attribute_flags_compose() {
        let attrs = PrivilegeAttributes::Enabled | PrivilegeAttributes::UsedForAccess;
        assert!(attrs.contains(PrivilegeAttributes::Enabled));
        assert!(attrs.contains(PrivilegeAttributes::UsedForAccess));
        assert!(!attrs.contains(PrivilegeAttributes::EnabledByDefault));
        assert!(attrs.is_usable());
        assert!(!PrivilegeAttributes::Disabled.is_usable());
    }
}
