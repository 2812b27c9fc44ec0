use super::{CAData, ClientConfig, Credentials};

use dirs::home_dir;

use std::fmt::{self, Display};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Error loading a kubeconfig file, or resolving a `ClientConfig` from it
#[derive(Debug)]
pub enum KubeConfigError {
    Io(io::Error),
    Format(serde_yaml::Error),
    MissingCredentials(String),
    NoHomeDir,
    Invalid(String),
    Exec(String),
}

impl From<serde_yaml::Error> for KubeConfigError {
    fn from(err: serde_yaml::Error) -> KubeConfigError {
        KubeConfigError::Format(err)
    }
}

impl From<io::Error> for KubeConfigError {
    fn from(err: io::Error) -> KubeConfigError {
        KubeConfigError::Io(err)
    }
}

impl Display for KubeConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KubeConfigError::Io(e) => write!(f, "IO error: {}", e),
            KubeConfigError::Format(e) => write!(f, "Kubeconfig format error: {}", e),
            KubeConfigError::MissingCredentials(user) => write!(
                f,
                "No supported credentials found for user '{}'. Supported mechanisms are token, username/password, client certificate, and exec",
                user
            ),
            KubeConfigError::NoHomeDir => {
                f.write_str("Unable to determine HOME directory to load ~/.kube/config")
            }
            KubeConfigError::Invalid(msg) => write!(f, "Invalid kubeconfig file: {}", msg),
            KubeConfigError::Exec(msg) => write!(f, "exec credential plugin failed: {}", msg),
        }
    }
}

impl std::error::Error for KubeConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KubeConfigError::Io(e) => Some(e),
            KubeConfigError::Format(e) => Some(e),
            _ => None,
        }
    }
}

fn kubeconfig_path() -> Result<PathBuf, KubeConfigError> {
    if let Some(path) = std::env::var_os("KUBECONFIG").filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    home_dir()
        .map(|home| home.join(".kube").join("config"))
        .ok_or(KubeConfigError::NoHomeDir)
}

pub(crate) fn load_from_kubeconfig(user_agent: String) -> Result<ClientConfig, KubeConfigError> {
    let (kubeconfig, path) = KubeConfig::load()?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    kubeconfig.create_client_config(user_agent, dir)
}

// The structs below only cover the parts of the kubeconfig format that are used to build a
// `ClientConfig`. Unknown fields are ignored.

#[derive(Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
struct ClusterInfo {
    server: String,
    certificate_authority_data: Option<String>,
    certificate_authority: Option<PathBuf>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct NamedCluster {
    name: String,
    cluster: ClusterInfo,
}

#[derive(Deserialize, Debug, PartialEq, Clone, Default)]
#[serde(rename_all = "kebab-case")]
struct UserInfo {
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
    client_certificate_data: Option<String>,
    client_key_data: Option<String>,
    client_certificate: Option<PathBuf>,
    client_key: Option<PathBuf>,
    #[serde(rename = "as")]
    as_user: Option<String>,
    #[serde(default)]
    as_groups: Vec<String>,
    exec: Option<Exec>,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct Exec {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Vec<ExecEnv>,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct ExecEnv {
    name: String,
    value: String,
}

/// The output of an exec credential plugin
#[derive(Deserialize, Debug)]
struct ExecCredential {
    status: ExecCredentialStatus,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ExecCredentialStatus {
    token: String,
    expiration_timestamp: Option<String>,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserInfo,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct ContextInfo {
    cluster: String,
    user: String,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
struct NamedContext {
    name: String,
    context: ContextInfo,
}

/// A parsed kubeconfig file
#[derive(Deserialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct KubeConfig {
    current_context: String,
    clusters: Vec<NamedCluster>,
    users: Vec<NamedUser>,
    contexts: Vec<NamedContext>,
}

impl KubeConfig {
    /// Loads the kubeconfig from `$KUBECONFIG`, or `~/.kube/config` if that's not set. The path
    /// that the file was loaded from is returned along with it.
    pub fn load() -> Result<(KubeConfig, PathBuf), KubeConfigError> {
        let path = kubeconfig_path()?;
        let conf = KubeConfig::load_file(&path)?;
        Ok((conf, path))
    }

    pub fn load_file(path: &Path) -> Result<KubeConfig, KubeConfigError> {
        let reader = File::open(path)?;
        let conf = serde_yaml::from_reader(reader)?;
        Ok(conf)
    }

    /// Resolves the current context into a `ClientConfig`. Relative paths in the file are
    /// resolved against `base_dir`, which should be the directory the file was loaded from.
    pub fn create_client_config(
        &self,
        user_agent: String,
        base_dir: &Path,
    ) -> Result<ClientConfig, KubeConfigError> {
        let context = self
            .contexts
            .iter()
            .find(|ctx| ctx.name == self.current_context)
            .ok_or_else(|| {
                KubeConfigError::Invalid(format!(
                    "no context found for current-context '{}'",
                    self.current_context
                ))
            })?;
        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == context.context.cluster)
            .ok_or_else(|| {
                KubeConfigError::Invalid(format!(
                    "no cluster found with name '{}'",
                    context.context.cluster
                ))
            })?;
        let user = self
            .users
            .iter()
            .find(|u| u.name == context.context.user)
            .ok_or_else(|| {
                KubeConfigError::Invalid(format!(
                    "no user found with name '{}'",
                    context.context.user
                ))
            })?;

        let credentials = resolve_credentials(&user.name, &user.user, base_dir)?;
        let ca_data = match (
            cluster.cluster.certificate_authority_data.as_ref(),
            cluster.cluster.certificate_authority.as_ref(),
        ) {
            (Some(data), _) => Some(CAData::Contents(data.clone())),
            (None, Some(path)) => Some(CAData::File(resolve_path(base_dir, path))),
            (None, None) => None,
        };

        Ok(ClientConfig {
            api_server_endpoint: cluster.cluster.server.clone(),
            credentials,
            ca_data,
            verify_ssl_certs: !cluster.cluster.insecure_skip_tls_verify,
            impersonate: user.user.as_user.clone(),
            impersonate_groups: user.user.as_groups.clone(),
            user_agent,
        })
    }
}

fn resolve_path(base_dir: &Path, path: &Path) -> String {
    base_dir.join(path).to_string_lossy().into_owned()
}

fn resolve_credentials(
    user_name: &str,
    user: &UserInfo,
    base_dir: &Path,
) -> Result<Credentials, KubeConfigError> {
    if let Some(token) = user.token.as_ref() {
        log::debug!("Using bearer token for kubeconfig user '{}'", user_name);
        return Ok(Credentials::bearer_token(token));
    }
    if let Some(username) = user.username.as_ref() {
        let password = user.password.as_ref().ok_or_else(|| {
            KubeConfigError::Invalid("username is specified without a password".to_owned())
        })?;
        log::debug!("Using basic auth for kubeconfig user '{}'", user_name);
        return Ok(Credentials::basic(username, password));
    }
    if let Some(exec) = user.exec.as_ref() {
        return exec_token(exec).map(|token| Credentials::bearer_token(&token));
    }
    if let Some(cert) = user.client_certificate_data.as_ref() {
        let key = user.client_key_data.as_ref().ok_or_else(|| {
            KubeConfigError::Invalid(
                "client-certificate-data is specified without client-key-data".to_owned(),
            )
        })?;
        return Ok(Credentials::Pem {
            certificate_base64: cert.clone(),
            private_key_base64: key.clone(),
        });
    }
    if let Some(cert) = user.client_certificate.as_ref() {
        let key = user.client_key.as_ref().ok_or_else(|| {
            KubeConfigError::Invalid(
                "client-certificate is specified without client-key".to_owned(),
            )
        })?;
        return Ok(Credentials::PemPath {
            certificate_path: resolve_path(base_dir, cert),
            private_key_path: resolve_path(base_dir, key),
        });
    }
    Err(KubeConfigError::MissingCredentials(user_name.to_owned()))
}

fn exec_token(exec: &Exec) -> Result<String, KubeConfigError> {
    use std::process::Command;

    log::debug!("Getting credentials from exec plugin: '{}'", exec.command);
    let mut cmd = Command::new(exec.command.as_str());
    cmd.args(exec.args.iter());
    for var in exec.env.iter() {
        cmd.env(var.name.as_str(), var.value.as_str());
    }
    let output = cmd.output()?;
    if !output.status.success() {
        return Err(KubeConfigError::Exec(format!(
            "'{}' exited with status: {}",
            exec.command, output.status
        )));
    }
    let credential: ExecCredential = serde_yaml::from_slice(output.stdout.as_slice())
        .map_err(|err| {
            KubeConfigError::Exec(format!(
                "invalid output from '{}': {}",
                exec.command, err
            ))
        })?;
    log::info!(
        "Got token from exec plugin '{}', expiration: {:?}",
        exec.command,
        credential.status.expiration_timestamp
    );
    Ok(credential.status.token)
}
