use crate::{
    error::Error,
    session::{SessionId, INVALID_SESSION_ID},
};

/// Win32 codes that `WTSQueryUserToken` returns when the session is gone:
/// `ERROR_FILE_NOT_FOUND`, `ERROR_INVALID_PARAMETER` and
/// `ERROR_CTX_WINSTATION_NOT_FOUND`.
pub const SESSION_NOT_FOUND_CODES: [u32; 3] = [2, 87, 7022];

/// Which session a token should be resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSelector {
    /// A specific session.
    Id(SessionId),

    /// Whatever session is attached to the physical console at call time.
    ActiveConsole,
}

impl From<SessionId> for SessionSelector {
    /// Maps [`INVALID_SESSION_ID`] to [`SessionSelector::ActiveConsole`].
    fn from(id: SessionId) -> Self {
        match id {
            INVALID_SESSION_ID => SessionSelector::ActiveConsole,
            id => SessionSelector::Id(id),
        }
    }
}

/// `TOKEN_ELEVATION_TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElevationType {
    /// UAC is off or the user is not a split-token account.
    Default,

    /// The full, elevated token of a split-token account.
    Full,

    /// The filtered token of a split-token account; carries a linked full token.
    Limited,
}

impl ElevationType {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(ElevationType::Default),
            2 => Some(ElevationType::Full),
            3 => Some(ElevationType::Limited),
            _ => None,
        }
    }
}

/// `TOKEN_TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Primary,
    Impersonation,
}

impl TokenType {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(TokenType::Primary),
            2 => Some(TokenType::Impersonation),
            _ => None,
        }
    }
}

#[cfg_attr(not(windows), allow(dead_code))]
/// Translates a failed `WTSQueryUserToken` into the crate taxonomy.
pub(crate) fn query_failure(session: SessionId, code: u32) -> Error {
    if SESSION_NOT_FOUND_CODES.contains(&code) {
        Error::SessionNotFound(session)
    } else {
        Error::TokenQueryFailed(code)
    }
}

#[cfg_attr(not(windows), allow(dead_code))]
/// The linked token is used only for a limited token when elevation was asked for.
pub(crate) fn wants_linked(elevation: ElevationType, elevated: bool) -> bool {
    elevated && elevation == ElevationType::Limited
}

#[cfg(windows)]
pub use self::resolver::*;

#[cfg(windows)]
mod resolver {
    use super::{query_failure, wants_linked, ElevationType, SessionSelector, TokenType};
    use crate::{
        error::{last_error, Error, Result},
        handle::{KernelHandle, LocalBuffer, RawHandle},
        session::{active_console_session_id, find_session, SessionId},
    };
    use core::ptr::{null, null_mut};
    use windows_sys::Win32::{
        Foundation::{ERROR_BAD_LENGTH, ERROR_INSUFFICIENT_BUFFER, FALSE},
        Security::{
            DuplicateTokenEx, GetTokenInformation, SecurityImpersonation, TokenElevationType,
            TokenLinkedToken, TokenPrimary, TokenType as TokenTypeClass, TOKEN_INFORMATION_CLASS,
            TOKEN_LINKED_TOKEN,
        },
        System::RemoteDesktop::WTSQueryUserToken,
    };

    /// A primary access token, usable with `CreateProcessAsUserW`.
    ///
    /// Only the resolver constructs it, so holding one means the handle was
    /// duplicated with `TokenPrimary`.
    #[derive(Debug)]
    pub struct PrimaryToken(KernelHandle);

    impl PrimaryToken {
        /// The raw token handle, valid while `self` is alive.
        pub fn as_raw(&self) -> RawHandle {
            self.0.as_raw()
        }

        /// Re-queries the elevation type of this token.
        pub fn elevation_type(&self) -> Result<ElevationType> {
            elevation_type(&self.0).map_err(Error::TokenQueryFailed)
        }

        /// Re-queries the token type; always [`TokenType::Primary`] for a resolved token.
        pub fn token_type(&self) -> Result<TokenType> {
            let buffer = token_information(&self.0, TokenTypeClass).map_err(Error::TokenQueryFailed)?;
            let raw = unsafe { *buffer.pin().as_ptr::<i32>() };
            TokenType::from_raw(raw).ok_or(Error::TokenQueryFailed(ERROR_BAD_LENGTH))
        }
    }

    /// Resolves the session's user to a primary token.
    ///
    /// # Parameters
    ///
    /// * `selector` - The session, or [`SessionSelector::ActiveConsole`].
    /// * `elevated` - When the session token is a limited (UAC-filtered) token,
    ///   use its linked full token instead. Ignored for other tokens.
    ///
    /// # Returns
    ///
    /// * `Ok(PrimaryToken)` - A fresh primary token owned by the caller.
    /// * `Err(Error)` - `NoActiveSession`, `SessionNotFound`, `TokenQueryFailed`
    ///   or `TokenDuplicationFailed`.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let token = resolve_user_token(SessionSelector::ActiveConsole, false)?;
    /// ```
    pub fn resolve_user_token(selector: impl Into<SessionSelector>, elevated: bool) -> Result<PrimaryToken> {
        let session = match selector.into() {
            SessionSelector::Id(id) => id,
            SessionSelector::ActiveConsole => active_console_session_id().ok_or(Error::NoActiveSession)?,
        };

        let session_token = query_user_token(session)?;
        let elevation = elevation_type(&session_token).map_err(Error::TokenQueryFailed)?;
        tracing::debug!(session, ?elevation, elevated, "queried session token");

        let primary = if wants_linked(elevation, elevated) {
            let linked = linked_token(&session_token).map_err(Error::TokenQueryFailed)?;
            duplicate_as_primary(&linked)?
        } else {
            duplicate_as_primary(&session_token)?
        };

        drop(session_token);
        Ok(primary)
    }

    /// Resolves the first session owned by `user_name` (case-insensitive).
    pub fn resolve_user_token_by_name(user_name: &str, elevated: bool) -> Result<PrimaryToken> {
        let session = find_session(|session| session.state.has_user() && session.matches_user(user_name, None))?
            .ok_or_else(|| Error::UserNotFound(user_name.to_owned()))?;

        resolve_user_token(SessionSelector::Id(session.id), elevated)
    }

    fn query_user_token(session: SessionId) -> Result<KernelHandle> {
        let mut raw = null_mut();
        if unsafe { WTSQueryUserToken(session, &mut raw) } == FALSE {
            return Err(query_failure(session, last_error()));
        }

        Ok(unsafe { KernelHandle::from_raw(raw) })
    }

    fn duplicate_as_primary(source: &KernelHandle) -> Result<PrimaryToken> {
        let mut raw = null_mut();
        if unsafe {
            DuplicateTokenEx(
                source.as_raw(),
                0,
                null(),
                SecurityImpersonation,
                TokenPrimary,
                &mut raw,
            )
        } == FALSE
        {
            return Err(Error::TokenDuplicationFailed(last_error()));
        }

        Ok(PrimaryToken(unsafe { KernelHandle::from_raw(raw) }))
    }

    fn elevation_type(token: &KernelHandle) -> core::result::Result<ElevationType, u32> {
        let buffer = token_information(token, TokenElevationType)?;
        let raw = unsafe { *buffer.pin().as_ptr::<i32>() };

        Ok(ElevationType::from_raw(raw).unwrap_or_else(|| {
            tracing::warn!(raw, "unknown token elevation type, treating as default");
            ElevationType::Default
        }))
    }

    fn linked_token(token: &KernelHandle) -> core::result::Result<KernelHandle, u32> {
        let buffer = token_information(token, TokenLinkedToken)?;
        let linked = unsafe { (*buffer.pin().as_ptr::<TOKEN_LINKED_TOKEN>()).LinkedToken };

        Ok(unsafe { KernelHandle::from_raw(linked) })
    }

    /// Two-phase `GetTokenInformation`: probe the size, then fetch into a heap buffer.
    pub(crate) fn token_information(
        token: &KernelHandle,
        class: TOKEN_INFORMATION_CLASS,
    ) -> core::result::Result<LocalBuffer, u32> {
        let mut len = 0u32;
        if unsafe { GetTokenInformation(token.as_raw(), class, null_mut(), 0, &mut len) } == FALSE {
            let code = last_error();
            if code != ERROR_INSUFFICIENT_BUFFER && code != ERROR_BAD_LENGTH {
                return Err(code);
            }
        }

        if len == 0 {
            return Err(ERROR_BAD_LENGTH);
        }

        let buffer = LocalBuffer::alloc(len as usize)?;
        if unsafe { GetTokenInformation(token.as_raw(), class, buffer.as_raw(), len, &mut len) } == FALSE {
            return Err(last_error());
        }

        Ok(buffer)
    }
}
