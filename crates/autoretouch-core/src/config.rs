use std::env;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use directories::ProjectDirs;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const ENV_REFRESH_TOKEN: &str = "AUTORETOUCH_REFRESH_TOKEN";
pub const ENV_CREDENTIALS_PATH: &str = "AUTORETOUCH_CREDENTIALS_PATH";
pub const ENV_ORGANIZATION_ID: &str = "AUTORETOUCH_ORGANIZATION_ID";
pub const ENV_ENVIRONMENT: &str = "AUTORETOUCH_ENV";

pub const DEFAULT_USER_AGENT: &str = concat!("autoretouch-rs/", env!("CARGO_PKG_VERSION"));
const CREDENTIALS_FILE_NAME: &str = "credentials.json";
const DEFAULT_SCOPE: &str = "offline_access";

/// Connection settings for one autoRetouch deployment.
///
/// Every request made by the library derives its URL from this value; there is
/// no process-wide environment selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: Url,
    pub auth_domain: Url,
    pub client_id: String,
    pub scope: String,
    pub audience: String,
}

impl ApiConfig {
    pub fn new(
        base_url: &str,
        auth_domain: &str,
        client_id: impl Into<String>,
        scope: impl Into<String>,
        audience: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            base_url: Url::parse(base_url)?,
            auth_domain: Url::parse(auth_domain)?,
            client_id: client_id.into(),
            scope: scope.into(),
            audience: audience.into(),
        })
    }

    pub fn production() -> Self {
        Self::new(
            "https://api.autoretouch.com",
            "https://auth.autoretouch.com",
            "V8EkfbxtBi93cAySTVWAecEum4d6pt4J",
            DEFAULT_SCOPE,
            "https://api.autoretouch.com",
        )
        .expect("valid production config")
    }

    pub fn staging() -> Self {
        Self::new(
            "https://api.dev.autoretouch.com",
            "https://dev-autoretouch.eu.auth0.com",
            "DtLZblh4cfQdNc1iNXNV2JXy4zFL6qCM",
            DEFAULT_SCOPE,
            "https://api.dev.autoretouch.com/",
        )
        .expect("valid staging config")
    }

    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Production => Self::production(),
            Environment::Staging => Self::staging(),
        }
    }

    /// URL on the auth domain, e.g. `oauth/token`.
    pub fn auth_url(&self, path: &str) -> Result<Url, ConfigError> {
        join(&self.auth_domain, path)
    }

    /// URL below the versioned API root (`{base_url}/v1`).
    pub fn api_url(&self, path: &str) -> Result<Url, ConfigError> {
        join(&self.base_url, &format!("v1/{}", path.trim_start_matches('/')))
    }

    /// URL below the unversioned API root, used for health checks.
    pub fn root_url(&self, path: &str) -> Result<Url, ConfigError> {
        join(&self.base_url, path)
    }
}

fn join(base: &Url, path: &str) -> Result<Url, ConfigError> {
    let root = base.as_str().trim_end_matches('/');
    let path = path.trim_start_matches('/');
    Ok(Url::parse(&format!("{root}/{path}"))?)
}

/// Deployments with built-in presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Production,
    Staging,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "staging" | "dev" => Ok(Environment::Staging),
            other => Err(ConfigError::UnknownEnvironment(other.to_owned())),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Environment::Production => "production",
            Environment::Staging => "staging",
        };
        write!(f, "{value}")
    }
}

/// Application-specific configuration helpers.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    root: PathBuf,
}

impl ConfigLocator {
    /// Attempt to discover the persistent configuration directory, creating it if needed.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("com", "autoretouch", "autoretouch")
            .ok_or(ConfigError::MissingProjectDirs)?;
        let config_dir = dirs.config_dir();
        fs::create_dir_all(config_dir).map_err(ConfigError::CreateDir)?;
        set_user_only_permissions(config_dir)?;
        Ok(Self {
            root: config_dir.to_path_buf(),
        })
    }

    pub fn from_root(root: PathBuf) -> Self {
        Self { root }
    }

    /// Default location of the persisted credentials file.
    pub fn credentials_file(&self) -> PathBuf {
        self.root.join(CREDENTIALS_FILE_NAME)
    }
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Overrides read from the process environment.
///
/// The credentials file is only consulted when no refresh token is supplied.
#[derive(Debug, Clone, Default)]
pub struct ClientSettings {
    pub environment: Environment,
    pub refresh_token: Option<String>,
    pub credentials_path: Option<PathBuf>,
    pub organization_id: Option<Uuid>,
}

impl ClientSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = match non_empty_var(ENV_ENVIRONMENT) {
            Some(value) => value.parse()?,
            None => Environment::default(),
        };
        let organization_id = match non_empty_var(ENV_ORGANIZATION_ID) {
            Some(value) => Some(
                Uuid::parse_str(value.trim())
                    .map_err(|_| ConfigError::InvalidOrganizationId(value))?,
            ),
            None => None,
        };
        Ok(Self {
            environment,
            refresh_token: non_empty_var(ENV_REFRESH_TOKEN),
            credentials_path: non_empty_var(ENV_CREDENTIALS_PATH).map(PathBuf::from),
            organization_id,
        })
    }

    /// Explicit credentials path, or the default file in the user configuration directory.
    pub fn resolve_credentials_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.credentials_path {
            Some(path) => Ok(path.clone()),
            None => Ok(ConfigLocator::new()?.credentials_file()),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Errors that can occur when working with configuration directories.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine configuration directory for autoretouch")]
    MissingProjectDirs,
    #[error("failed to create configuration directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("unknown environment '{0}' (expected 'production' or 'staging')")]
    UnknownEnvironment(String),
    #[error("invalid organization id '{0}'")]
    InvalidOrganizationId(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn credentials_file_lives_in_root() {
        let temp_dir = TempDir::new().unwrap();
        let locator = ConfigLocator::from_root(temp_dir.path().to_path_buf());
        let path = locator.credentials_file();
        assert!(path.ends_with("credentials.json"));
        assert!(path.starts_with(temp_dir.path()));
    }

    #[test]
    fn urls_are_joined_below_roots() {
        let config = ApiConfig::staging();
        assert_eq!(
            config.auth_url("oauth/device/code").unwrap().as_str(),
            "https://dev-autoretouch.eu.auth0.com/oauth/device/code"
        );
        assert_eq!(
            config.api_url("/organization").unwrap().as_str(),
            "https://api.dev.autoretouch.com/v1/organization"
        );
        assert_eq!(
            config.root_url("health").unwrap().as_str(),
            "https://api.dev.autoretouch.com/health"
        );
    }

    #[test]
    fn parse_environment_names() {
        assert_eq!("prod".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("Staging".parse::<Environment>().unwrap(), Environment::Staging);
        assert!(matches!(
            "qa".parse::<Environment>().unwrap_err(),
            ConfigError::UnknownEnvironment(name) if name == "qa"
        ));
    }

    #[test]
    fn environment_presets_differ() {
        assert_ne!(
            ApiConfig::for_environment(Environment::Production),
            ApiConfig::for_environment(Environment::Staging)
        );
    }

    #[test]
    fn explicit_credentials_path_wins() {
        let settings = ClientSettings {
            credentials_path: Some(PathBuf::from("/tmp/creds.json")),
            ..Default::default()
        };
        assert_eq!(
            settings.resolve_credentials_path().unwrap(),
            PathBuf::from("/tmp/creds.json")
        );
    }
}
