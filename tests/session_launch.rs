//! End-to-end checks against a live machine. They need SYSTEM (or the
//! delegate-impersonation privilege) and a user logged on to the console.

#![cfg(windows)]

use std::collections::HashSet;

use session_runas::{
    launch, list_sessions, require_privilege, resolve_user_token, ElevationType, Error, LaunchOptions,
    SessionSelector, TokenType, DELEGATE_SESSION_USER_IMPERSONATE,
};

#[test]
fn session_ids_are_unique() {
    let sessions = list_sessions().expect("enumerate sessions");
    let ids: HashSet<_> = sessions.iter().map(|session| session.id).collect();
    assert_eq!(ids.len(), sessions.len());
}

#[test]
fn nonexistent_privilege_is_missing() {
    let name = "SeNonexistentTestOnlyPrivilege";
    assert_eq!(require_privilege(name), Err(Error::MissingPrivilege(name.into())));
}

#[test]
#[ignore = "requires SYSTEM and an interactive session"]
fn resolved_token_is_primary() {
    require_privilege(DELEGATE_SESSION_USER_IMPERSONATE).expect("privilege");
    let token = resolve_user_token(SessionSelector::ActiveConsole, false).expect("token");
    assert_eq!(token.token_type().expect("token type"), TokenType::Primary);
}

#[test]
#[ignore = "requires SYSTEM and an interactive session with a UAC split token"]
fn elevated_and_filtered_tokens_differ() {
    let filtered = resolve_user_token(SessionSelector::ActiveConsole, false).expect("filtered token");
    let elevated = resolve_user_token(SessionSelector::ActiveConsole, true).expect("elevated token");

    assert_eq!(filtered.elevation_type().expect("elevation"), ElevationType::Limited);
    assert_eq!(elevated.elevation_type().expect("elevation"), ElevationType::Full);
}

#[test]
#[ignore = "requires SYSTEM and an interactive session"]
fn exit_code_is_reported_without_capture() {
    let token = resolve_user_token(SessionSelector::ActiveConsole, false).expect("token");
    let result = launch(&token, &LaunchOptions::new("cmd.exe /c exit 7")).expect("launch");

    assert_eq!(result.exit_code, 7);
    assert_eq!(result.stdout, None);
    assert_eq!(result.stderr, None);
}

#[test]
#[ignore = "requires SYSTEM and an interactive session"]
fn large_stdout_before_stderr_does_not_deadlock() {
    let token = resolve_user_token(SessionSelector::ActiveConsole, false).expect("token");

    // Roughly 100KB on stdout before a single line on stderr.
    let script = "for /L %i in (1,1,1000) do @echo 0123456789012345678901234567890123456789012345678901234567890123456789012345678901234567890123456789";
    let command = format!("cmd.exe /c \"({script}) & echo done 1>&2\"");
    let result = launch(&token, &LaunchOptions::new(command).redirect(true)).expect("launch");

    let stdout = result.stdout.expect("captured stdout");
    assert_eq!(result.exit_code, 0);
    assert_eq!(stdout.lines().count(), 1000);
    assert!(stdout.len() > 64 * 1024);
    assert_eq!(result.stderr.as_deref().map(str::trim), Some("done"));
}
