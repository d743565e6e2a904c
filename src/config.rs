//! Process configuration, read once from the environment at startup.

use crate::Error;
use std::path::Path;
use std::time::Duration;

/// The only wire format this crate speaks.
pub const HTTP_STREAM: &str = "http-stream";

pub const FN_FORMAT: &str = "FN_FORMAT";
pub const FN_LISTENER: &str = "FN_LISTENER";
pub const FDK_DEBUG: &str = "FDK_DEBUG";
pub const FN_APP_ID: &str = "FN_APP_ID";
pub const FN_APP_NAME: &str = "FN_APP_NAME";
pub const FN_FN_ID: &str = "FN_FN_ID";
pub const FN_FN_NAME: &str = "FN_FN_NAME";
pub const OCI_TRACING_ENABLED: &str = "OCI_TRACING_ENABLED";
pub const OCI_TRACE_COLLECTOR_URL: &str = "OCI_TRACE_COLLECTOR_URL";
pub const FDK_MAX_CONNECTIONS: &str = "FDK_MAX_CONNECTIONS";
pub const FDK_IDLE_TIMEOUT: &str = "FDK_IDLE_TIMEOUT";

/// Concurrent connections served before the accept loop stops accepting.
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// How long a connection may sit between requests before it is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

const TRUTHY: &[&str] = &[
    "true", "1", "t", "y", "yes", "yeah", "yup", "certainly", "uh-huh",
];

/// Settings shared read-only by every connection.
#[derive(Debug, Clone)]
pub struct Config {
    format: String,
    listener: String,
    debug: bool,
    app_id: Option<String>,
    app_name: Option<String>,
    fn_id: Option<String>,
    fn_name: Option<String>,
    tracing_enabled: bool,
    trace_collector_url: Option<String>,
    max_connections: usize,
    idle_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            format: HTTP_STREAM.into(),
            listener: String::new(),
            debug: false,
            app_id: None,
            app_name: None,
            fn_id: None,
            fn_name: None,
            tracing_enabled: false,
            trace_collector_url: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

impl Config {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, Error> {
        Config::from_vars(std::env::vars())
    }

    /// Read configuration from explicit name/value pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut config = Config::default();
        let mut listener = None;
        let mut format = None;

        for (k, v) in vars {
            let v: String = v.into();
            match k.as_ref() {
                FN_FORMAT => format = Some(v),
                FN_LISTENER => listener = Some(v),
                FDK_DEBUG => config.debug = TRUTHY.contains(&v.to_lowercase().as_str()),
                FN_APP_ID => config.app_id = Some(v),
                FN_APP_NAME => config.app_name = Some(v),
                FN_FN_ID => config.fn_id = Some(v),
                FN_FN_NAME => config.fn_name = Some(v),
                // passed as "0" or "1"
                OCI_TRACING_ENABLED => {
                    config.tracing_enabled = v.trim().parse::<u8>().map(|n| n != 0).unwrap_or(false)
                }
                OCI_TRACE_COLLECTOR_URL => config.trace_collector_url = Some(v),
                FDK_MAX_CONNECTIONS => {
                    config.max_connections = match v.trim().parse::<usize>() {
                        Ok(n) if n > 0 => n,
                        _ => {
                            return Err(Error::Config(format!(
                                "{} must be a positive integer: {:?}",
                                FDK_MAX_CONNECTIONS, v
                            )))
                        }
                    }
                }
                // whole seconds, 0 keeps idle connections open
                FDK_IDLE_TIMEOUT => {
                    config.idle_timeout = match v.trim().parse::<u64>() {
                        Ok(0) => None,
                        Ok(n) => Some(Duration::from_secs(n)),
                        Err(_) => {
                            return Err(Error::Config(format!(
                                "{} must be a number of seconds: {:?}",
                                FDK_IDLE_TIMEOUT, v
                            )))
                        }
                    }
                }
                _ => {}
            }
        }

        match format {
            Some(f) if f == HTTP_STREAM => config.format = f,
            Some(f) => return Err(Error::Config(format!("incompatible function format: {:?}", f))),
            None => warn!("{} is not set, assuming {}", FN_FORMAT, HTTP_STREAM),
        }

        let listener = listener.ok_or_else(|| Error::Config(format!("{} is not set", FN_LISTENER)))?;
        config.listener = strip_scheme(&listener).to_string();

        let file_name = Path::new(&config.listener).file_name();
        if config.listener.ends_with('/') || file_name.is_none() {
            return Err(Error::Config(format!(
                "malformed {} value: {:?}",
                FN_LISTENER, listener
            )));
        }

        Ok(config)
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    /// Socket path the platform connects to, scheme stripped.
    pub fn listener(&self) -> &str {
        &self.listener
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    pub fn app_name(&self) -> Option<&str> {
        self.app_name.as_deref()
    }

    pub fn fn_id(&self) -> Option<&str> {
        self.fn_id.as_deref()
    }

    pub fn fn_name(&self) -> Option<&str> {
        self.fn_name.as_deref()
    }

    pub fn tracing_enabled(&self) -> bool {
        self.tracing_enabled
    }

    pub fn trace_collector_url(&self) -> Option<&str> {
        self.trace_collector_url.as_deref()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// `None` when idle connections are never closed.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }
}

/// Strip a leading `unix:` scheme marker.
pub fn strip_scheme(addr: &str) -> &str {
    addr.strip_prefix("unix:").unwrap_or(addr)
}
