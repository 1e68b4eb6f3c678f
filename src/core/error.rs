use crate::core::network::AddressFamily;
use thiserror::Error;

/// Substring ip6tables prints when the kernel has no IPv6 NAT support.
pub const IPV6_NAT_UNAVAILABLE: &str =
    "can't initialize ip6tables table `nat': Table does not exist";

/// Core error types for tunwall
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No working binary was found for an address family
    #[error("no supported {family} firewall engine found: {details}")]
    EngineUnavailable {
        family: AddressFamily,
        details: String,
    },

    /// The engine refused to modify rules because of missing privileges
    #[error("{binary} cannot modify rules: NET_ADMIN capability is missing")]
    NetAdminMissing { binary: String },

    /// An IPv6 rule was requested but no ip6tables engine exists
    #[error("{0}: ip6tables is required, please upgrade your kernel to support it")]
    NeedIp6tables(String),

    /// Engine command exited with a failure
    #[error("command failed: \"{command}\": {output}")]
    CommandFailed {
        command: String,
        output: String,
        exit_code: Option<i32>,
    },

    /// Policy token other than ACCEPT or DROP
    #[error("unknown policy: {0}")]
    PolicyUnknown(String),

    /// `--version` output could not be parsed
    #[error("iptables version string is too short: {0}")]
    VersionTooShort(String),

    /// The caller cancelled the operation while a command was running
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Routing collaborator could not report the topology
    #[error("routing error: {0}")]
    Routing(String),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Error annotated with the phase that produced it
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps this error with a description of the failing phase.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns the innermost error, skipping context layers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when the engine reported that the IPv6 `nat` table is missing.
    pub fn is_ipv6_nat_unavailable(&self) -> bool {
        match self.root() {
            Error::CommandFailed { output, .. } => output.contains(IPV6_NAT_UNAVAILABLE),
            _ => false,
        }
    }
}

/// Adds phase context to fallible results.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|err| err.context(context))
    }

    fn with_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|err| err.context(f()))
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("net_admin")
        {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run tunwall as root or grant the NET_ADMIN capability")
                .with_suggestion("In a container, start it with --cap-add=NET_ADMIN")
                .with_suggestion("Or set TUNWALL_ELEVATION_METHOD=sudo for NOPASSWD setups");
        }

        // IPv6 NAT missing is tolerated during redirection but worth explaining
        if lower.contains("can't initialize ip6tables table `nat'") {
            return ErrorTranslation::new("The kernel does not support IPv6 NAT")
                .with_suggestion("IPv6 port redirection is skipped on this kernel")
                .with_suggestion("Load the module if available: sudo modprobe ip6table_nat");
        }

        // Missing table on any family
        if lower.contains("can't initialize") && lower.contains("table") {
            return ErrorTranslation::new("Firewall table is not available in the kernel")
                .with_suggestion("Check loaded modules: lsmod | grep -E 'ip6?table'")
                .with_suggestion("Try the other backend: iptables-legacy or iptables-nft")
                .with_help("https://wiki.archlinux.org/title/Iptables");
        }

        // Missing binaries
        if lower.contains("no such file")
            || lower.contains("command not found")
            || lower.contains("no supported")
        {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo apk add iptables ip6tables  (Alpine)")
                .with_suggestion("Or: sudo dnf install iptables-nft  (Fedora/RHEL)");
        }

        // Deleting a rule that is not installed
        if lower.contains("bad rule") || lower.contains("does a matching rule exist") {
            return ErrorTranslation::new("Firewall rule to remove does not exist")
                .with_suggestion("The rule may already have been removed by another tool")
                .with_suggestion("List current rules: sudo iptables-save");
        }

        // Unknown chain, target or match module
        if lower.contains("no chain/target/match") || lower.contains("couldn't load") {
            return ErrorTranslation::new("Unknown chain, target or match extension")
                .with_suggestion("Check the spelling of chains in your post-rules file")
                .with_suggestion("The kernel may lack the required xt_* module")
                .with_help("https://ipset.netfilter.org/iptables-extensions.man.html");
        }

        // xtables lock contention
        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable")
        {
            return ErrorTranslation::new("Another process holds the xtables lock")
                .with_suggestion("Another firewall manager may be running")
                .with_suggestion("Wait a moment and try again");
        }

        if lower.contains("unknown policy") {
            return ErrorTranslation::new("Invalid chain policy")
                .with_suggestion("Policies must be ACCEPT or DROP");
        }

        if lower.contains("cancelled") {
            return ErrorTranslation::new("Operation was interrupted")
                .with_suggestion("Rules were rolled back to their previous state");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables-save")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
