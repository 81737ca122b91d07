use core::fmt;
use serde::Serialize;

/// Numeric identifier assigned by the OS to a logon session.
///
/// Identifiers are reused after logoff.
pub type SessionId = u32;

/// Value returned by `WTSGetActiveConsoleSessionId` when no session is attached
/// to the console.
pub const INVALID_SESSION_ID: SessionId = 0xFFFF_FFFF;

/// Connection state of a session, mirroring `WTS_CONNECTSTATE_CLASS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Active,
    Connected,
    ConnectQuery,
    Shadow,
    Disconnected,
    Idle,
    Listen,
    Reset,
    Down,
    Init,
}

impl SessionState {
    /// Decodes a raw `WTS_CONNECTSTATE_CLASS` value.
    ///
    /// Values outside the documented range decode as [`SessionState::Down`],
    /// which is never eligible for token resolution.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => SessionState::Active,
            1 => SessionState::Connected,
            2 => SessionState::ConnectQuery,
            3 => SessionState::Shadow,
            4 => SessionState::Disconnected,
            5 => SessionState::Idle,
            6 => SessionState::Listen,
            7 => SessionState::Reset,
            8 => SessionState::Down,
            9 => SessionState::Init,
            _ => SessionState::Down,
        }
    }

    /// Listen, Down, Init and Reset sessions never have a user attached.
    pub fn has_user(self) -> bool {
        !matches!(
            self,
            SessionState::Listen | SessionState::Down | SessionState::Init | SessionState::Reset
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Immutable snapshot of one session, as seen at enumeration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// OS-assigned session identifier.
    pub id: SessionId,

    /// Logged-on user, if any could be read.
    pub user_name: Option<String>,

    /// Domain of the logged-on user, if any could be read.
    pub domain_name: Option<String>,

    /// Window station name (`Console`, `RDP-Tcp#0`, `Services`...).
    pub station_name: Option<String>,

    /// Connection state.
    pub state: SessionState,
}

impl Session {
    /// Returns `DOMAIN\user`.
    ///
    /// When the domain is missing, returns the bare user name if `fallback`
    /// is set, `None` otherwise.
    pub fn down_level_name(&self, fallback: bool) -> Option<String> {
        match (self.domain_name.as_deref(), self.user_name.as_deref()) {
            (Some(domain), Some(user)) => Some(format!("{domain}\\{user}")),
            (None, Some(user)) if fallback => Some(user.to_owned()),
            _ => None,
        }
    }

    /// Case-insensitive match on user name and, when given, domain name.
    pub fn matches_user(&self, user_name: &str, domain_name: Option<&str>) -> bool {
        let user_matches = self
            .user_name
            .as_deref()
            .is_some_and(|name| name.eq_ignore_ascii_case(user_name));

        let domain_matches = match domain_name {
            Some(wanted) => self
                .domain_name
                .as_deref()
                .is_some_and(|name| name.eq_ignore_ascii_case(wanted)),
            None => true,
        };

        user_matches && domain_matches
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\\{} (Session {}, {})",
            self.domain_name.as_deref().unwrap_or_default(),
            self.user_name.as_deref().unwrap_or_default(),
            self.id,
            self.state
        )
    }
}

#[cfg(windows)]
pub use self::directory::*;

#[cfg(windows)]
mod directory {
    use super::{Session, SessionId, SessionState, INVALID_SESSION_ID};
    use crate::{
        error::{last_error, Error, Result},
        handle::{Owned, WtsBuffer},
    };
    use core::ptr::null_mut;
    use windows_sys::Win32::{
        Foundation::FALSE,
        System::RemoteDesktop::{
            WTSDomainName, WTSEnumerateSessionsW, WTSGetActiveConsoleSessionId,
            WTSQuerySessionInformationW, WTSQueryUserToken, WTSUserName, WTSWinStationName,
            WTS_INFO_CLASS, WTS_SESSION_INFOW,
        },
    };

    /// Enumerates every session on the local machine.
    ///
    /// Each call takes a fresh snapshot. A per-field string query that fails
    /// leaves that field `None` instead of failing the enumeration.
    pub fn list_sessions() -> Result<Vec<Session>> {
        let mut raw_info: *mut WTS_SESSION_INFOW = null_mut();
        let mut count = 0u32;
        if unsafe { WTSEnumerateSessionsW(null_mut(), 0, 1, &mut raw_info, &mut count) } == FALSE {
            return Err(Error::EnumerationFailed(last_error()));
        }

        let buffer: WtsBuffer = unsafe { Owned::from_raw(raw_info.cast()) };
        if buffer.is_invalid() {
            return Ok(Vec::new());
        }

        let pinned = buffer.pin();
        let records = unsafe {
            core::slice::from_raw_parts(pinned.as_ptr::<WTS_SESSION_INFOW>(), count as usize)
        };

        let sessions: Vec<Session> = records
            .iter()
            .map(|record| Session {
                id: record.SessionId,
                user_name: session_string(record.SessionId, WTSUserName),
                domain_name: session_string(record.SessionId, WTSDomainName),
                station_name: session_string(record.SessionId, WTSWinStationName),
                state: SessionState::from_raw(record.State),
            })
            .collect();

        tracing::debug!(count = sessions.len(), "enumerated sessions");
        Ok(sessions)
    }

    /// Sessions for which a user token can currently be queried.
    pub fn list_eligible_sessions() -> Result<Vec<Session>> {
        Ok(list_sessions()?
            .into_iter()
            .filter(Session::is_token_eligible)
            .collect())
    }

    /// The session physically attached to the console, if any.
    pub fn active_console_session_id() -> Option<SessionId> {
        match unsafe { WTSGetActiveConsoleSessionId() } {
            INVALID_SESSION_ID => None,
            id => Some(id),
        }
    }

    /// Snapshot of the console session, if one exists and is still listed.
    pub fn active_console_session() -> Result<Option<Session>> {
        match active_console_session_id() {
            Some(id) => find_session_by_id(id),
            None => Ok(None),
        }
    }

    /// First session, in enumeration order, accepted by `predicate`.
    pub fn find_session<F>(mut predicate: F) -> Result<Option<Session>>
    where
        F: FnMut(&Session) -> bool,
    {
        Ok(list_sessions()?.into_iter().find(|session| predicate(session)))
    }

    pub fn find_session_by_id(id: SessionId) -> Result<Option<Session>> {
        find_session(|session| session.id == id)
    }

    /// First session owned by `user_name` (and `domain_name`, when given).
    pub fn find_session_by_user(user_name: &str, domain_name: Option<&str>) -> Result<Option<Session>> {
        find_session(|session| session.matches_user(user_name, domain_name))
    }

    impl Session {
        /// Returns `true` if a user token can be queried for this session now.
        ///
        /// The probe token is released before returning.
        pub fn is_token_eligible(&self) -> bool {
            if !self.state.has_user() {
                return false;
            }

            let mut raw = null_mut();
            if unsafe { WTSQueryUserToken(self.id, &mut raw) } == FALSE {
                return false;
            }

            drop(unsafe { crate::handle::KernelHandle::from_raw(raw) });
            true
        }
    }

    fn session_string(id: SessionId, class: WTS_INFO_CLASS) -> Option<String> {
        let mut raw: *mut u16 = null_mut();
        let mut bytes = 0u32;
        if unsafe { WTSQuerySessionInformationW(null_mut(), id, class, &mut raw, &mut bytes) } == FALSE {
            tracing::warn!(session = id, class, error = last_error(), "session string query failed");
            return None;
        }

        let buffer: WtsBuffer = unsafe { Owned::from_raw(raw.cast()) };
        if buffer.is_invalid() || bytes == 0 {
            return None;
        }

        let pinned = buffer.pin();
        let units = unsafe {
            core::slice::from_raw_parts(pinned.as_ptr::<u16>(), bytes as usize / 2)
        };
        let len = units.iter().position(|unit| *unit == 0).unwrap_or(units.len());
        let value = String::from_utf16_lossy(&units[..len]);

        (!value.is_empty()).then_some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(user: Option<&str>, domain: Option<&str>) -> Session {
        Session {
            id: 2,
            user_name: user.map(str::to_owned),
            domain_name: domain.map(str::to_owned),
            station_name: Some("Console".into()),
            state: SessionState::Active,
        }
    }

    #[test]
    fn raw_states_decode_in_wts_order() {
        assert_eq!(SessionState::from_raw(0), SessionState::Active);
        assert_eq!(SessionState::from_raw(4), SessionState::Disconnected);
        assert_eq!(SessionState::from_raw(6), SessionState::Listen);
        assert_eq!(SessionState::from_raw(9), SessionState::Init);
        assert_eq!(SessionState::from_raw(42), SessionState::Down);
        assert_eq!(SessionState::from_raw(-1), SessionState::Down);
    }

    #[test]
    fn only_user_bearing_states_have_users() {
        for state in [SessionState::Listen, SessionState::Down, SessionState::Init, SessionState::Reset] {
            assert!(!state.has_user(), "{state}");
        }
        for state in [SessionState::Active, SessionState::Disconnected, SessionState::Idle] {
            assert!(state.has_user(), "{state}");
        }
    }

    #[test]
    fn down_level_name_prefers_domain() {
        assert_eq!(session(Some("alice"), Some("CORP")).down_level_name(false).as_deref(), Some("CORP\\alice"));
        assert_eq!(session(Some("alice"), None).down_level_name(false), None);
        assert_eq!(session(Some("alice"), None).down_level_name(true).as_deref(), Some("alice"));
        assert_eq!(session(None, None).down_level_name(true), None);
    }

    #[test]
    fn user_match_is_case_insensitive() {
        let s = session(Some("Alice"), Some("CORP"));
        assert!(s.matches_user("alice", None));
        assert!(s.matches_user("ALICE", Some("corp")));
        assert!(!s.matches_user("alice", Some("OTHER")));
        assert!(!s.matches_user("bob", None));
        assert!(!session(None, None).matches_user("alice", None));
    }

    #[test]
    fn display_matches_quser_style() {
        let s = session(Some("alice"), Some("CORP"));
        assert_eq!(s.to_string(), "CORP\\alice (Session 2, Active)");
        assert_eq!(session(None, None).to_string(), "\\ (Session 2, Active)");
    }
}
