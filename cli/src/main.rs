use anyhow::Result;
use clap::{ArgGroup, Parser, Subcommand};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Run programs inside the desktop session of a logged-on user
#[derive(Parser, Debug)]
#[command(name = "session-runas", version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
#[cfg_attr(not(windows), allow(dead_code))]
enum Command {
    /// List interactive sessions
    Sessions {
        /// Only the session with this id
        #[arg(long)]
        id: Option<u32>,

        /// Only sessions owned by this user
        #[arg(short, long)]
        user: Option<String>,

        /// Domain of `--user`
        #[arg(long, requires = "user")]
        domain: Option<String>,

        /// Only the session attached to the console
        #[arg(long, conflicts_with_all = ["id", "user"])]
        console: bool,

        /// Include sessions no user token can be queried for
        #[arg(short, long)]
        all: bool,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Print the environment a session's user would get
    #[command(group(ArgGroup::new("target").args(["session", "console"]).multiple(false)))]
    Env {
        /// Session id (defaults to the console session)
        #[arg(short, long)]
        session: Option<u32>,

        /// Use the session attached to the console
        #[arg(long)]
        console: bool,

        /// Print only this variable
        name: Option<String>,
    },

    /// Run a command as the user of a session
    #[command(group(ArgGroup::new("target").args(["session", "console", "user"]).multiple(false)))]
    Run {
        /// Session id (defaults to the console session)
        #[arg(short, long)]
        session: Option<u32>,

        /// Use the session attached to the console
        #[arg(long)]
        console: bool,

        /// Use the first session owned by this user
        #[arg(short, long)]
        user: Option<String>,

        /// Use the user's elevated token when UAC split it
        #[arg(short, long)]
        elevated: bool,

        /// Capture stdout and stderr instead of opening a console
        #[arg(short, long, conflicts_with = "show_window")]
        redirect: bool,

        /// Show the child's window
        #[arg(short = 'w', long = "show-window")]
        show_window: bool,

        /// Working directory (defaults to the user's profile)
        #[arg(long)]
        cwd: Option<String>,

        /// Path of the executable, when the command line alone is ambiguous
        #[arg(long)]
        app: Option<String>,

        /// Command line to run
        #[arg(last = true, required_unless_present = "app")]
        command: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // --debug > --verbose > RUST_LOG > warn. Logs go to stderr so captured
    // child output on stdout stays clean.
    let filter = if args.debug {
        EnvFilter::new("debug")
    } else if args.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .init();

    let code = execute(args.command)?;
    if code != 0 {
        std::process::exit(code);
    }

    Ok(())
}

#[cfg(not(windows))]
fn execute(_command: Command) -> Result<i32> {
    anyhow::bail!("session-runas only runs on Windows")
}

#[cfg(windows)]
fn execute(command: Command) -> Result<i32> {
    use anyhow::Context;
    use session_runas::{
        active_console_session, find_session_by_id, find_session_by_user, launch, list_eligible_sessions,
        list_sessions, require_privilege, resolve_user_token, resolve_user_token_by_name,
        session_environment, LaunchOptions, WindowStyle, DELEGATE_SESSION_USER_IMPERSONATE,
    };

    match command {
        Command::Sessions { id, user, domain, console, all, json } => {
            let sessions: Vec<_> = if console {
                active_console_session()?.into_iter().collect()
            } else if let Some(id) = id {
                find_session_by_id(id)?.into_iter().collect()
            } else if let Some(user) = user.as_deref() {
                find_session_by_user(user, domain.as_deref())?.into_iter().collect()
            } else if all {
                list_sessions()?
            } else {
                list_eligible_sessions()?
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                for session in &sessions {
                    println!("{session} [{}]", session.station_name.as_deref().unwrap_or("-"));
                }
            }

            Ok(0)
        }

        Command::Env { session, console: _, name } => {
            let variables = session_environment(target(session))?;
            match name {
                Some(name) => match variables.get(&name) {
                    Some(value) => println!("{value}"),
                    None => anyhow::bail!("variable '{name}' is not defined"),
                },
                None => {
                    let mut pairs: Vec<_> = variables.iter().collect();
                    pairs.sort_by_key(|(name, _)| name.to_uppercase());
                    for (name, value) in pairs {
                        println!("{name}={value}");
                    }
                }
            }

            Ok(0)
        }

        Command::Run { session, console: _, user, elevated, redirect, show_window, cwd, app, command } => {
            // Fail before any token or pipe is allocated.
            require_privilege(DELEGATE_SESSION_USER_IMPERSONATE)?;

            let token = match user.as_deref() {
                Some(user) => resolve_user_token_by_name(user, elevated)?,
                None => resolve_user_token(target(session), elevated)?,
            };

            let mut options = LaunchOptions::default()
                .redirect(redirect)
                .window(if show_window { WindowStyle::Normal } else { WindowStyle::Hidden });
            if !command.is_empty() {
                options = options.command_line(join_command_line(&command));
            }
            if let Some(app) = app {
                options = options.application(app);
            }
            if let Some(cwd) = cwd {
                options = options.working_directory(cwd);
            }

            let result = launch(&token, &options).context("launch failed")?;
            tracing::info!(%result, "child exited");

            match (&result.stdout, &result.stderr) {
                (None, None) => println!("{result}"),
                (stdout, stderr) => {
                    print!("{}", stdout.as_deref().unwrap_or_default());
                    eprint!("{}", stderr.as_deref().unwrap_or_default());
                }
            }

            Ok(result.exit_code_i32())
        }
    }
}

/// An explicit session id, or the console session.
#[cfg(windows)]
fn target(session: Option<u32>) -> session_runas::SessionSelector {
    session.map_or(session_runas::SessionSelector::ActiveConsole, session_runas::SessionSelector::from)
}

/// Joins arguments into a Windows command line that `CommandLineToArgvW`
/// splits back into the same arguments.
#[cfg_attr(not(windows), allow(dead_code))]
fn join_command_line(args: &[String]) -> String {
    args.iter().map(|arg| quote(arg)).collect::<Vec<_>>().join(" ")
}

#[cfg_attr(not(windows), allow(dead_code))]
fn quote(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_owned();
    }

    let mut quoted = String::from("\"");
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
                continue;
            }
            _ => {}
        }

        if c != '\\' {
            quoted.extend(std::iter::repeat('\\').take(backslashes));
            quoted.push(c);
            backslashes = 0;
        }
    }

    // Backslashes before the closing quote are doubled.
    quoted.extend(std::iter::repeat('\\').take(backslashes * 2));
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn run_collects_trailing_command() {
        let parsed = Args::try_parse_from(["session-runas", "run", "--session", "2", "-r", "--", "cmd.exe", "/c", "exit 3"])
            .expect("valid arguments");

        match parsed.command {
            Command::Run { session, redirect, command, .. } => {
                assert_eq!(session, Some(2));
                assert!(redirect);
                assert_eq!(command, args(&["cmd.exe", "/c", "exit 3"]));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn run_targets_are_exclusive() {
        let err = Args::try_parse_from(["session-runas", "run", "--console", "--user", "alice", "--", "whoami"]);
        assert!(err.is_err());
    }

    #[test]
    fn redirect_conflicts_with_show_window() {
        let err = Args::try_parse_from(["session-runas", "run", "-r", "-w", "--", "whoami"]);
        assert!(err.is_err());
    }

    #[test]
    fn run_requires_command_or_app() {
        assert!(Args::try_parse_from(["session-runas", "run"]).is_err());
        assert!(Args::try_parse_from(["session-runas", "run", "--app", "C:\\tool.exe"]).is_ok());
    }

    #[test]
    fn domain_requires_user() {
        assert!(Args::try_parse_from(["session-runas", "sessions", "--domain", "CORP"]).is_err());
        assert!(Args::try_parse_from(["session-runas", "sessions", "-u", "alice", "--domain", "CORP", "--json"]).is_ok());
    }

    #[test]
    fn plain_arguments_are_not_quoted() {
        assert_eq!(join_command_line(&args(&["cmd.exe", "/c", "whoami"])), "cmd.exe /c whoami");
    }

    #[test]
    fn arguments_with_spaces_or_quotes_are_quoted() {
        assert_eq!(join_command_line(&args(&["echo", "a b"])), "echo \"a b\"");
        assert_eq!(join_command_line(&args(&["echo", ""])), "echo \"\"");
        assert_eq!(quote("say \"hi\""), "\"say \\\"hi\\\"\"");
    }

    #[test]
    fn trailing_backslashes_are_doubled_inside_quotes() {
        assert_eq!(quote("C:\\Program Files\\"), "\"C:\\Program Files\\\\\"");
        assert_eq!(quote("C:\\dir\\file"), "C:\\dir\\file");
        assert_eq!(quote("a\\\\\"b c"), "\"a\\\\\\\\\\\"b c\"");
    }
}
