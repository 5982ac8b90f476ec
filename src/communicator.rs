//! Connection parameters for the remote-command communicator.
//!
//! The actual SSH/WinRM transport lives outside this crate; the pipeline
//! only prepares and rewrites the parameters a communicator would use. The
//! tunnel step rewrites the port, the Windows password step fills in the
//! password, and OS Login rewrites the username.

use serde::Deserialize;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default WinRM-over-HTTPS port.
pub const DEFAULT_WINRM_PORT: u16 = 5986;

/// Kind of remote-command transport a build uses.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CommKind {
    /// SSH transport.
    Ssh,
    /// WinRM transport.
    Winrm,
    /// No communicator; the build only waits on instance signals.
    None,
}

impl CommKind {
    /// Parses the configuration spelling of a communicator kind.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ssh" => Some(Self::Ssh),
            "winrm" => Some(Self::Winrm),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    /// Default connection port for this transport.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Ssh | Self::None => DEFAULT_SSH_PORT,
            Self::Winrm => DEFAULT_WINRM_PORT,
        }
    }
}

/// Mutable connection parameters threaded through the build.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommSettings {
    /// Transport kind.
    pub kind: CommKind,
    /// Host to connect to; filled in once the instance has an address.
    pub host: Option<String>,
    /// Port to connect to; rewritten by the tunnel step.
    pub port: u16,
    /// Login username; rewritten by OS Login when in use.
    pub username: String,
    /// Login password; filled in by the Windows password step.
    pub password: Option<String>,
}

impl CommSettings {
    /// Creates settings for a transport with its default port.
    #[must_use]
    pub fn new(kind: CommKind, username: impl Into<String>, password: Option<String>) -> Self {
        Self {
            kind,
            host: None,
            port: kind.default_port(),
            username: username.into(),
            password,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("ssh", Some(CommKind::Ssh))]
    #[case("winrm", Some(CommKind::Winrm))]
    #[case("none", Some(CommKind::None))]
    #[case("telnet", None)]
    #[case("SSH", None)]
    fn parse_accepts_known_kinds(#[case] input: &str, #[case] expected: Option<CommKind>) {
        assert_eq!(CommKind::parse(input), expected);
    }

    #[test]
    fn winrm_defaults_to_https_port() {
        let comm = CommSettings::new(CommKind::Winrm, "administrator", None);
        assert_eq!(comm.port, DEFAULT_WINRM_PORT);
    }
}
