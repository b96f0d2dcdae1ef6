use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use autoretouch_core::api::{AutoretouchClient, Organization, Workflow, WorkflowExecution};
use autoretouch_core::auth::{
    AuthError, CredentialManager, DeviceFlowAuthenticator, FileCredentialStore, OAuthClient,
};
use autoretouch_core::config::{ApiConfig, ClientSettings, Environment};
use autoretouch_core::services::ImageProcessor;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about = "autoRetouch command line client")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Deployment to talk to (production or staging)
    #[arg(long = "env", global = true)]
    environment: Option<Environment>,
    /// Credentials file (defaults to the user config directory)
    #[arg(long, global = true)]
    credentials: Option<PathBuf>,
    /// Refresh token to use instead of the credentials file
    #[arg(long = "refresh-token", global = true)]
    refresh_token: Option<String>,
    /// Default organization id for all requests
    #[arg(long, global = true)]
    organization: Option<Uuid>,
    /// Do not open the verification page in a browser
    #[arg(long = "no-browser", global = true)]
    no_browser: bool,
    /// Log debug output to stderr
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Authenticate and store credentials
    Login,
    /// Revoke the refresh token and delete stored credentials
    Logout,
    /// Check API availability
    Health(HealthArgs),
    /// List organizations of the authenticated user
    Organizations(ListArgs),
    /// List workflows of an organization
    Workflows(ListArgs),
    /// List executions of a workflow
    Executions(ExecutionsArgs),
    /// Upload an image and print its content hash
    Upload(UploadArgs),
    /// Run one image through a workflow and download the result
    Process(ProcessArgs),
    /// Run every image in a directory through a workflow
    Batch(BatchArgs),
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct HealthArgs {
    /// Check the versioned API root instead of the service root
    #[arg(long)]
    current: bool,
}

#[derive(Args, Debug)]
struct ExecutionsArgs {
    /// Workflow id
    #[arg(long)]
    workflow: Uuid,
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct UploadArgs {
    /// Image file to upload
    image: PathBuf,
}

#[derive(Args, Debug)]
struct ProcessArgs {
    /// Image file to process
    image: PathBuf,
    /// Workflow id
    #[arg(long)]
    workflow: Uuid,
    /// Directory the result is written to
    #[arg(long = "output-dir", default_value = ".")]
    output_dir: PathBuf,
    /// Label attached to the execution, as key=value (repeatable)
    #[arg(long = "label", value_parser = parse_label)]
    labels: Vec<(String, String)>,
}

#[derive(Args, Debug)]
struct BatchArgs {
    /// Directory containing .jpg, .jpeg and .png images
    image_dir: PathBuf,
    /// Workflow id
    #[arg(long)]
    workflow: Uuid,
    /// Directory results are written to
    #[arg(long = "output-dir")]
    output_dir: PathBuf,
    /// Images processed at the same time
    #[arg(long, default_value_t = 8)]
    concurrency: usize,
    /// Output a JSON report
    #[arg(long)]
    json: bool,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.verbose);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let uses_credentials = !matches!(cli.command, Commands::Health(_));
    let session = Session::build(&cli.global, uses_credentials, cancel)?;
    match cli.command {
        Commands::Login => login(&session).await?,
        Commands::Logout => logout(&session).await?,
        Commands::Health(args) => health(&session, args).await?,
        Commands::Organizations(args) => organizations(&session, args).await?,
        Commands::Workflows(args) => workflows(&session, args).await?,
        Commands::Executions(args) => executions(&session, args).await?,
        Commands::Upload(args) => upload(&session, args).await?,
        Commands::Process(args) => process(&session, args).await?,
        Commands::Batch(args) => batch(&session, args).await?,
    }
    Ok(())
}

/// Client plus the settings it was built from.
struct Session {
    client: AutoretouchClient,
    /// `None` when the command never touches stored credentials.
    credentials_path: Option<PathBuf>,
    organization_id: Option<Uuid>,
}

impl Session {
    fn build(
        global: &GlobalArgs,
        uses_credentials: bool,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut settings = ClientSettings::from_env().context("invalid environment settings")?;
        if let Some(environment) = global.environment {
            settings.environment = environment;
        }
        if let Some(path) = &global.credentials {
            settings.credentials_path = Some(path.clone());
        }
        if let Some(token) = &global.refresh_token {
            settings.refresh_token = Some(token.clone());
        }
        if global.organization.is_some() {
            settings.organization_id = global.organization;
        }

        let config = ApiConfig::for_environment(settings.environment);
        let credentials_path = if uses_credentials {
            Some(
                settings
                    .resolve_credentials_path()
                    .context("unable to resolve credentials path")?,
            )
        } else {
            None
        };
        debug!(
            environment = %settings.environment,
            credentials = ?credentials_path,
            "client settings resolved"
        );

        let oauth = OAuthClient::new(config.clone()).context("failed to build OAuth client")?;
        let authenticator = DeviceFlowAuthenticator::new(oauth.clone())
            .with_browser(!global.no_browser)
            .with_cancellation(cancel);
        let mut manager = CredentialManager::new(oauth).with_authenticator(authenticator);
        if let Some(path) = &credentials_path {
            manager = manager.with_store(FileCredentialStore::new(path.clone()));
        }
        if let Some(token) = settings.refresh_token {
            manager = manager.with_refresh_token(token);
        }

        let client = AutoretouchClient::new(config, Arc::new(manager))
            .context("failed to build API client")?
            .with_default_organization(settings.organization_id);

        Ok(Self {
            client,
            credentials_path,
            organization_id: settings.organization_id,
        })
    }

    fn credentials_location(&self) -> String {
        self.credentials_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "-".into())
    }

    /// Organization for commands that need one: the configured id, or the
    /// only organization the user belongs to.
    async fn organization(&self) -> Result<Uuid> {
        if let Some(id) = self.organization_id {
            return Ok(id);
        }
        let page = self
            .client
            .organizations()
            .await
            .context("failed to list organizations")?;
        match page.entries.as_slice() {
            [only] => Ok(only.id),
            [] => Err(anyhow!("no organization available for this account")),
            _ => Err(anyhow!(
                "multiple organizations available; pass --organization or set AUTORETOUCH_ORGANIZATION_ID"
            )),
        }
    }
}

async fn login(session: &Session) -> Result<()> {
    let credentials = session.client.login().await.context("login failed")?;
    println!(
        "Login succeeded. Credentials stored at {}.",
        session.credentials_location()
    );
    println!("Access token expires at {} (UTC).", credentials.expires_at);
    Ok(())
}

async fn logout(session: &Session) -> Result<()> {
    match session.client.credentials().revoke().await {
        Ok(status) => println!("Refresh token revoked (status {status})."),
        Err(AuthError::NoCredentialsAvailable) => println!("No credentials to revoke."),
        Err(err) => return Err(err).context("failed to revoke refresh token"),
    }
    session
        .client
        .credentials()
        .forget()
        .await
        .context("failed to remove stored credentials")?;
    println!(
        "Deleted credentials at {}.",
        session.credentials_location()
    );
    Ok(())
}

async fn health(session: &Session, args: HealthArgs) -> Result<()> {
    let status = if args.current {
        session.client.health_current().await
    } else {
        session.client.health().await
    }
    .context("health request failed")?;
    println!("{status}");
    if !status.is_success() {
        return Err(anyhow!("API is unhealthy ({status})"));
    }
    Ok(())
}

async fn organizations(session: &Session, args: ListArgs) -> Result<()> {
    let page = session
        .client
        .organizations()
        .await
        .context("failed to list organizations")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&page)?);
    } else {
        render_organizations(&page.entries);
    }
    Ok(())
}

async fn workflows(session: &Session, args: ListArgs) -> Result<()> {
    let organization = session.organization().await?;
    let page = session
        .client
        .workflows(Some(organization))
        .await
        .context("failed to list workflows")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&page)?);
    } else {
        render_workflows(&page.entries);
    }
    Ok(())
}

async fn executions(session: &Session, args: ExecutionsArgs) -> Result<()> {
    let organization = session.organization().await?;
    let page = session
        .client
        .workflow_executions(args.workflow, Some(organization))
        .await
        .context("failed to list workflow executions")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&page)?);
    } else {
        render_executions(&page.entries);
        println!("{} of {} shown", page.entries.len(), page.total);
    }
    Ok(())
}

async fn upload(session: &Session, args: UploadArgs) -> Result<()> {
    let organization = session.organization().await?;
    let hash = session
        .client
        .upload_image(&args.image, Some(organization))
        .await
        .with_context(|| format!("failed to upload {}", args.image.display()))?;
    println!("{hash}");
    Ok(())
}

async fn process(session: &Session, args: ProcessArgs) -> Result<()> {
    let organization = session.organization().await?;
    let processor = ImageProcessor::new(session.client.clone())
        .with_organization(Some(organization))
        .with_labels(args.labels.into_iter().collect());

    let ok = processor
        .process_image(&args.image, args.workflow, &args.output_dir)
        .await
        .with_context(|| format!("failed to process {}", args.image.display()))?;

    if ok {
        println!(
            "Processed {} into {}.",
            args.image.display(),
            args.output_dir.display()
        );
        Ok(())
    } else {
        Err(anyhow!("execution failed for {}", args.image.display()))
    }
}

async fn batch(session: &Session, args: BatchArgs) -> Result<()> {
    let organization = session.organization().await?;
    // Any device-flow prompt happens before the first upload starts.
    session.client.login().await.context("login failed")?;

    let processor = ImageProcessor::new(session.client.clone())
        .with_organization(Some(organization))
        .with_concurrency(args.concurrency);
    let items = processor
        .process_batch(args.workflow, &args.image_dir, &args.output_dir)
        .await
        .with_context(|| format!("failed to read {}", args.image_dir.display()))?;

    let failures = items
        .iter()
        .filter(|item| !matches!(item.result, Ok(true)))
        .count();

    if args.json {
        let report: Vec<_> = items
            .iter()
            .map(|item| {
                let (status, error) = match &item.result {
                    Ok(true) => ("completed", None),
                    Ok(false) => ("failed", None),
                    Err(err) => ("error", Some(err.to_string())),
                };
                serde_json::json!({
                    "path": item.path.display().to_string(),
                    "status": status,
                    "error": error,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for item in &items {
            match &item.result {
                Ok(true) => println!("Processed {} successfully", item.path.display()),
                Ok(false) => println!("Execution failed for {}", item.path.display()),
                Err(err) => println!("Error for {}: {err}", item.path.display()),
            }
        }
    }

    if failures > 0 {
        return Err(anyhow!("{failures} of {} images failed", items.len()));
    }
    Ok(())
}

fn parse_label(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() => Ok((key.to_owned(), val.to_owned())),
        _ => Err(format!("expected key=value, got '{value}'")),
    }
}

fn render_organizations(organizations: &[Organization]) {
    println!("{:<36} {:<40}", "ID", "NAME");
    println!("{}", "-".repeat(80));
    for organization in organizations {
        println!(
            "{:<36} {:<40}",
            organization.id,
            truncate(&organization.name, 40)
        );
    }
}

fn render_workflows(workflows: &[Workflow]) {
    println!("{:<36} {:<32} {:>8}", "ID", "NAME", "PRICE");
    println!("{}", "-".repeat(80));
    for workflow in workflows {
        let price = workflow
            .execution_price
            .map(|price| price.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<36} {:<32} {:>8}",
            workflow.id,
            truncate(&workflow.name, 32),
            price
        );
    }
}

fn render_executions(executions: &[WorkflowExecution]) {
    println!("{:<36} {:<10} {:<32}", "ID", "STATUS", "INPUT");
    println!("{}", "-".repeat(80));
    for execution in executions {
        println!(
            "{:<36} {:<10} {:<32}",
            execution.id,
            format!("{:?}", execution.status).to_uppercase(),
            truncate(execution.input_file_name.as_deref().unwrap_or("-"), 32)
        );
    }
}

fn truncate(value: &str, max_len: usize) -> String {
    let mut chars = value.chars();
    let mut collected = String::new();
    for _ in 0..max_len.saturating_sub(1) {
        match chars.next() {
            Some(ch) => collected.push(ch),
            None => return value.to_owned(),
        }
    }
    if chars.next().is_some() {
        collected.push('…');
        collected
    } else {
        value.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_parse_as_key_value() {
        assert_eq!(
            parse_label("sku=123").unwrap(),
            ("sku".to_owned(), "123".to_owned())
        );
        assert_eq!(
            parse_label("note=a=b").unwrap(),
            ("note".to_owned(), "a=b".to_owned())
        );
        assert!(parse_label("=x").is_err());
        assert!(parse_label("plain").is_err());
    }

    #[test]
    fn truncate_marks_cut_values() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
    }

    #[test]
    fn health_skips_credentials_file() {
        let cli = Cli::try_parse_from(["autoretouch", "health", "--current"]).unwrap();
        assert!(matches!(cli.command, Commands::Health(HealthArgs { current: true })));

        let session = Session::build(&cli.global, false, CancellationToken::new()).unwrap();
        assert!(session.credentials_path.is_none());
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "autoretouch",
            "workflows",
            "--env",
            "staging",
            "--organization",
            "9f8e7d6c-5b4a-4392-8170-6f5e4d3c2b1a",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.global.environment, Some(Environment::Staging));
        assert!(cli.global.organization.is_some());
        assert!(matches!(cli.command, Commands::Workflows(ListArgs { json: true })));
    }
}
