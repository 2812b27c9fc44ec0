//! Configuration for the operator itself (`OperatorConfig`) and for the connection to the api
//! server (`ClientConfig`). Both can be built programmatically, and both have a way to be loaded
//! from the environment that the operator runs in.
mod kubeconfig;

pub use self::kubeconfig::{KubeConfig, KubeConfigError};

use crate::label_selector::{LabelSelector, SelectorParseError};

use std::fmt::{self, Display};
use std::io;
use std::num::ParseIntError;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_OPERATOR_NAME: &str = "gateway-operator";
/// The label that's added to every child object created by the operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Secrets must carry this label, with a value of `gateway-operator`, in order to trigger
/// reconciliation of the gateways that reference them, unless a different selector is configured.
pub const DEFAULT_SECRET_LABEL: &str = "apps.gateway-operator.io/watched-by";
pub const DEFAULT_GATEWAY_IMAGE: &str = "quay.io/gateway-operator/gateway:latest";
pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(60);

pub const WATCH_NAMESPACE_ENV: &str = "WATCH_NAMESPACE";
pub const SECRET_LABEL_SELECTOR_ENV: &str = "SECRET_LABEL_SELECTOR";
pub const WORKERS_ENV: &str = "GATEWAY_OPERATOR_WORKERS";
pub const RECONCILE_TIMEOUT_ENV: &str = "GATEWAY_OPERATOR_RECONCILE_TIMEOUT_SECS";
pub const SERVER_PORT_ENV: &str = "GATEWAY_OPERATOR_SERVER_PORT";
pub const GATEWAY_IMAGE_ENV: &str = "GATEWAY_IMAGE";

const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const API_SERVER_HOSTNAME: &str = "kubernetes.default.svc";

/// An error with the operator's configuration
#[derive(Debug)]
pub enum ConfigError {
    InvalidSelector(SelectorParseError),
    InvalidNumber(&'static str, ParseIntError),
    Io(io::Error),
    KubeConfig(KubeConfigError),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::InvalidSelector(e) => write!(f, "Invalid secret label selector: {}", e),
            ConfigError::InvalidNumber(var, e) => write!(f, "Invalid value for {}: {}", var, e),
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::KubeConfig(e) => write!(f, "Failed to load kubeconfig: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidSelector(e) => Some(e),
            ConfigError::InvalidNumber(_, e) => Some(e),
            ConfigError::Io(e) => Some(e),
            ConfigError::KubeConfig(e) => Some(e),
        }
    }
}

impl From<SelectorParseError> for ConfigError {
    fn from(err: SelectorParseError) -> ConfigError {
        ConfigError::InvalidSelector(err)
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> ConfigError {
        ConfigError::Io(err)
    }
}

impl From<KubeConfigError> for ConfigError {
    fn from(err: KubeConfigError) -> ConfigError {
        ConfigError::KubeConfig(err)
    }
}

/// Settings for the exponential backoff that's applied to keys that fail or ask to be requeued
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(600),
            multiplier: 1.5,
            randomization_factor: 0.5,
        }
    }
}

/// Configuration of the operator's behavior. Create one with `OperatorConfig::new` or
/// `OperatorConfig::from_env` and then customize it using the builder functions.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Used as the value of the managed-by label on children, and in the user agent
    pub operator_name: String,
    /// The namespace to watch. `None` means all namespaces
    pub namespace: Option<String>,
    /// Only secrets matching this selector will trigger reconciliation of gateways
    pub secret_label_selector: LabelSelector,
    /// The image to use for gateways that don't specify one
    pub default_image: String,
    /// The number of keys that may be reconciled concurrently
    pub worker_count: usize,
    /// Reconciliation passes that take longer than this are abandoned and retried
    pub reconcile_timeout: Duration,
    pub backoff: BackoffConfig,
    pub server_port: u16,
    pub expose_metrics: bool,
    pub expose_health: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig::new(DEFAULT_OPERATOR_NAME)
    }
}

impl OperatorConfig {
    pub fn new(operator_name: impl Into<String>) -> OperatorConfig {
        let operator_name = operator_name.into();
        let secret_label_selector =
            LabelSelector::new().with_label(DEFAULT_SECRET_LABEL, operator_name.clone());
        OperatorConfig {
            operator_name,
            namespace: None,
            secret_label_selector,
            default_image: DEFAULT_GATEWAY_IMAGE.to_owned(),
            worker_count: DEFAULT_WORKER_COUNT,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            backoff: BackoffConfig::default(),
            server_port: DEFAULT_SERVER_PORT,
            expose_metrics: true,
            expose_health: true,
        }
    }

    /// Creates the default configuration, overridden by any of the environment variables that
    /// are set
    pub fn from_env() -> Result<OperatorConfig, ConfigError> {
        OperatorConfig::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<OperatorConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = OperatorConfig::default();
        if let Some(ns) = lookup(WATCH_NAMESPACE_ENV).filter(|ns| !ns.trim().is_empty()) {
            config = config.within_namespace(ns.trim());
        }
        if let Some(selector) = lookup(SECRET_LABEL_SELECTOR_ENV) {
            config = config.with_secret_label_selector(LabelSelector::parse(&selector)?);
        }
        if let Some(image) = lookup(GATEWAY_IMAGE_ENV).filter(|i| !i.trim().is_empty()) {
            config = config.with_default_image(image.trim());
        }
        if let Some(workers) = lookup(WORKERS_ENV) {
            let count = parse_number::<usize>(WORKERS_ENV, &workers)?;
            config = config.with_worker_count(count);
        }
        if let Some(timeout) = lookup(RECONCILE_TIMEOUT_ENV) {
            let secs = parse_number::<u64>(RECONCILE_TIMEOUT_ENV, &timeout)?;
            config = config.with_reconcile_timeout(Duration::from_secs(secs));
        }
        if let Some(port) = lookup(SERVER_PORT_ENV) {
            config = config.with_server_port(parse_number::<u16>(SERVER_PORT_ENV, &port)?);
        }
        Ok(config)
    }

    pub fn within_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_secret_label_selector(mut self, selector: LabelSelector) -> Self {
        self.secret_label_selector = selector;
        self
    }

    pub fn with_default_image(mut self, image: impl Into<String>) -> Self {
        self.default_image = image.into();
        self
    }

    /// Sets the number of concurrent workers. Values less than 1 are treated as 1
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server_port = port;
        self
    }

    pub fn expose_metrics(mut self, expose: bool) -> Self {
        self.expose_metrics = expose;
        self
    }

    pub fn expose_health(mut self, expose: bool) -> Self {
        self.expose_health = expose;
        self
    }
}

fn parse_number<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = ParseIntError>,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidNumber(var, e))
}

/// Certificate authority data, either inline (base64 encoded PEM) or as a path to a file
#[derive(Debug, Clone, PartialEq)]
pub enum CAData {
    File(String),
    Contents(String),
}

/// Credentials used to authenticate with the api server
#[derive(Clone, PartialEq)]
pub enum Credentials {
    /// The complete value of the `Authorization` header
    Header(String),
    /// Client certificate and key, given as base64 encoded PEM data
    Pem {
        certificate_base64: String,
        private_key_base64: String,
    },
    /// Paths to PEM files containing the client certificate and key
    PemPath {
        certificate_path: String,
        private_key_path: String,
    },
}

impl Credentials {
    pub fn bearer_token(token: &str) -> Credentials {
        Credentials::Header(format!("Bearer {}", token.trim()))
    }

    pub fn basic(username: &str, password: &str) -> Credentials {
        let encoded = base64::encode(format!("{}:{}", username, password));
        Credentials::Header(format!("Basic {}", encoded))
    }

    /// Returns the value of the `Authorization` header, if these credentials use one
    pub fn header_value(&self) -> Option<&str> {
        match self {
            Credentials::Header(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // never log the actual secrets
        match self {
            Credentials::Header(_) => f.write_str("Credentials::Header(<redacted>)"),
            Credentials::Pem { .. } => f.write_str("Credentials::Pem(<redacted>)"),
            Credentials::PemPath {
                certificate_path,
                private_key_path,
            } => f
                .debug_struct("Credentials::PemPath")
                .field("certificate_path", certificate_path)
                .field("private_key_path", private_key_path)
                .finish(),
        }
    }
}

/// Configuration of the connection to the api server
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_server_endpoint: String,
    pub credentials: Credentials,
    pub ca_data: Option<CAData>,
    pub verify_ssl_certs: bool,
    pub impersonate: Option<String>,
    pub impersonate_groups: Vec<String>,
    pub user_agent: String,
}

impl ClientConfig {
    /// Loads the configuration from the service account that's mounted into every pod. This is
    /// what's used when the operator runs inside the cluster.
    pub fn from_service_account(user_agent: impl Into<String>) -> Result<ClientConfig, ConfigError> {
        let token = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH)?;
        let ca_data = if Path::new(SERVICE_ACCOUNT_CA_PATH).exists() {
            Some(CAData::File(SERVICE_ACCOUNT_CA_PATH.to_owned()))
        } else {
            None
        };
        Ok(ClientConfig {
            api_server_endpoint: format!("https://{}", API_SERVER_HOSTNAME),
            credentials: Credentials::bearer_token(&token),
            ca_data,
            verify_ssl_certs: true,
            impersonate: None,
            impersonate_groups: Vec::new(),
            user_agent: user_agent.into(),
        })
    }

    /// Loads the configuration from the kubeconfig file at `$KUBECONFIG` or `~/.kube/config`
    pub fn from_kubeconfig(user_agent: impl Into<String>) -> Result<ClientConfig, ConfigError> {
        kubeconfig::load_from_kubeconfig(user_agent.into()).map_err(Into::into)
    }

    /// Tries the service account first, then falls back to the kubeconfig file
    pub fn load(user_agent: &str) -> Result<ClientConfig, ConfigError> {
        ClientConfig::from_service_account(user_agent).or_else(|err| {
            log::debug!(
                "Failed to load ClientConfig from service account ({}), so trying to load from kubeconfig",
                err
            );
            ClientConfig::from_kubeconfig(user_agent)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_used_when_env_is_empty() {
        let config = OperatorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(OperatorConfig::default(), config);
        assert_eq!(None, config.namespace);
        assert_eq!(
            Some(&DEFAULT_OPERATOR_NAME.to_owned()),
            config.secret_label_selector.match_labels.get(DEFAULT_SECRET_LABEL)
        );
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = OperatorConfig::from_lookup(lookup(&[
            (WATCH_NAMESPACE_ENV, "gateways"),
            (SECRET_LABEL_SELECTOR_ENV, "app=gateway"),
            (WORKERS_ENV, "0"),
            (RECONCILE_TIMEOUT_ENV, " 15 "),
            (SERVER_PORT_ENV, "9090"),
            (GATEWAY_IMAGE_ENV, "example.com/gateway:1.2"),
        ]))
        .unwrap();
        assert_eq!(Some("gateways"), config.namespace.as_deref());
        assert_eq!(LabelSelector::new().with_label("app", "gateway"), config.secret_label_selector);
        assert_eq!(1, config.worker_count);
        assert_eq!(Duration::from_secs(15), config.reconcile_timeout);
        assert_eq!(9090, config.server_port);
        assert_eq!("example.com/gateway:1.2", config.default_image);
    }

    #[test]
    fn invalid_env_values_are_errors() {
        let result = OperatorConfig::from_lookup(lookup(&[(WORKERS_ENV, "many")]));
        assert!(matches!(result, Err(ConfigError::InvalidNumber(WORKERS_ENV, _))));

        let result = OperatorConfig::from_lookup(lookup(&[(SECRET_LABEL_SELECTOR_ENV, "a in (b")]));
        assert!(matches!(result, Err(ConfigError::InvalidSelector(_))));
    }

    #[test]
    fn credentials_debug_output_is_redacted() {
        let creds = Credentials::bearer_token("super-secret\n");
        assert_eq!(Some("Bearer super-secret"), creds.header_value());
        assert!(!format!("{:?}", creds).contains("super-secret"));
        assert_eq!(
            Some("Basic dXNlcjpwYXNz"),
            Credentials::basic("user", "pass").header_value()
        );
    }
}
