//! Lifecycle event hooks.
//!
//! An optional user script is run with the event name as its only argument
//! and the current state in its environment. Events are fire-and-forget:
//! the script is never waited for, and failing to start it is only logged.

use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Startup,
    Shutdown,
    TunnelUp,
    TunnelDown,
    DhcpUpIp,
    DhcpDownIp,
    DhcpUpIp6,
    DhcpDownIp6,
}

impl Event {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::TunnelUp => "tunnelup",
            Self::TunnelDown => "tunneldown",
            Self::DhcpUpIp => "dhcpup_ip",
            Self::DhcpDownIp => "dhcpdown_ip",
            Self::DhcpUpIp6 => "dhcpup_ip6",
            Self::DhcpDownIp6 => "dhcpdown_ip6",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives lifecycle events
pub trait EventNotifier: Send {
    fn notify(&mut self, event: Event, env: &[(String, String)]);
}

/// Runs the configured event script, if any
#[derive(Debug, Clone, Default)]
pub struct ScriptNotifier {
    path: Option<PathBuf>,
}

impl ScriptNotifier {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn command(&self, event: Event, env: &[(String, String)]) -> Option<Command> {
        let path = self.path.as_ref()?;
        let mut command = Command::new(path);
        command
            .arg(event.as_str())
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());
        Some(command)
    }
}

impl EventNotifier for ScriptNotifier {
    fn notify(&mut self, event: Event, env: &[(String, String)]) {
        let Some(mut command) = self.command(event, env) else {
            return;
        };

        match command.spawn() {
            Ok(mut child) => {
                tracing::debug!("Triggered event '{event}'");
                // Reap without blocking the caller
                std::thread::spawn(move || {
                    if let Err(e) = child.wait() {
                        tracing::warn!("Waiting for event script failed: {e}");
                    }
                });
            }
            Err(e) => tracing::error!("Triggering event '{event}' failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn test_event_names() {
        assert_eq!(Event::TunnelUp.to_string(), "tunnelup");
        assert_eq!(Event::DhcpDownIp6.as_str(), "dhcpdown_ip6");
    }

    #[test]
    fn test_no_script_is_silent() {
        let mut notifier = ScriptNotifier::default();
        assert!(notifier.command(Event::Startup, &[]).is_none());
        notifier.notify(Event::Startup, &[]);
    }

    #[test]
    fn test_script_command() {
        let notifier = ScriptNotifier::new(Some(PathBuf::from("/etc/grecp/event.sh")));
        let env = vec![("tunnel_interface_name".to_string(), "hybrid0".to_string())];
        let command = notifier.command(Event::DhcpUpIp, &env).unwrap();

        assert_eq!(command.get_program(), OsStr::new("/etc/grecp/event.sh"));
        assert_eq!(command.get_args().collect::<Vec<_>>(), vec![OsStr::new("dhcpup_ip")]);
        let envs: Vec<_> = command.get_envs().collect();
        assert!(envs.contains(&(OsStr::new("tunnel_interface_name"), Some(OsStr::new("hybrid0")))));
    }

    #[test]
    fn test_missing_script_is_logged_not_fatal() {
        let mut notifier = ScriptNotifier::new(Some(PathBuf::from("/nonexistent/event.sh")));
        notifier.notify(Event::Shutdown, &[]);
    }
}
