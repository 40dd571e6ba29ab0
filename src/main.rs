use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args as ClapArgs, Parser, Subcommand};
use eirinix::handlers::{EventLogWatcher, PodAnnotationReconciler, StickyEnvExtension};
use eirinix::{Error, FailurePolicy, Manager, ManagerOptions};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register the webhooks and serve admission requests
    Run(RunArgs),
    /// Only watch Pods and log their events
    Watch(OptionsArgs),
    /// Print the resource names derived from the options
    Info(OptionsArgs),
    /// Show version information
    Version,
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    #[command(flatten)]
    options: OptionsArgs,

    /// Inject STICKY_MESSAGE with this value into every container
    #[arg(long, env = "EIRINIX_STICKY_MESSAGE")]
    sticky_message: Option<String>,

    /// Log every Pod event
    #[arg(long, env = "EIRINIX_LOG_EVENTS")]
    log_events: bool,

    /// Annotate watched Pods with touched=yes
    #[arg(long, env = "EIRINIX_ANNOTATE_PODS")]
    annotate_pods: bool,
}

#[derive(ClapArgs, Debug)]
struct OptionsArgs {
    /// YAML options file; flags override its values
    #[arg(long, env = "EIRINIX_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace to operate in, empty for all namespaces
    #[arg(long, env = "EIRINIX_NAMESPACE")]
    namespace: Option<String>,

    /// Host advertised in the webhook URL
    #[arg(long, env = "EIRINIX_HOST")]
    host: Option<String>,

    /// Port advertised in the webhook URL
    #[arg(long, env = "EIRINIX_PORT")]
    port: Option<u16>,

    /// Socket the admission server binds
    #[arg(long, env = "EIRINIX_LISTEN_ADDRESS")]
    listen_address: Option<SocketAddr>,

    /// Reach the webhook through this Service instead of host:port
    #[arg(long, env = "EIRINIX_SERVICE_NAME")]
    service_name: Option<String>,

    /// Namespace of the webhook Service
    #[arg(long, env = "EIRINIX_WEBHOOK_NAMESPACE")]
    webhook_namespace: Option<String>,

    /// Fail or Ignore
    #[arg(long, env = "EIRINIX_FAILURE_POLICY")]
    failure_policy: Option<FailurePolicy>,

    /// Prefix of generated resource names
    #[arg(long, env = "EIRINIX_OPERATOR_FINGERPRINT")]
    operator_fingerprint: Option<String>,

    /// Handle every Pod, not only those labeled source_type=APP
    #[arg(long, env = "EIRINIX_NO_FILTER")]
    no_filter: bool,

    /// Resource version the Pod watch starts from
    #[arg(long, env = "EIRINIX_START_RESOURCE_VERSION")]
    start_resource_version: Option<String>,

    /// Directory receiving the webhook certificate files
    #[arg(long, env = "EIRINIX_CERT_DIR")]
    cert_dir: Option<PathBuf>,

    /// Do not submit the webhook configuration
    #[arg(long, env = "EIRINIX_NO_REGISTER")]
    no_register: bool,

    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,
}

impl OptionsArgs {
    fn into_options(self) -> Result<ManagerOptions, Error> {
        let mut options = match &self.config {
            Some(path) => ManagerOptions::from_yaml_file(path)?,
            None => ManagerOptions::default(),
        };

        if let Some(namespace) = self.namespace {
            options.namespace = namespace;
        }
        if let Some(host) = self.host {
            options.host = host;
        }
        if let Some(port) = self.port {
            options.port = port;
        }
        if self.listen_address.is_some() {
            options.listen_address = self.listen_address;
        }
        if self.service_name.is_some() {
            options.service_name = self.service_name;
        }
        if self.webhook_namespace.is_some() {
            options.webhook_namespace = self.webhook_namespace;
        }
        if self.failure_policy.is_some() {
            options.failure_policy = self.failure_policy;
        }
        if let Some(fingerprint) = self.operator_fingerprint {
            options.operator_fingerprint = fingerprint;
        }
        if self.no_filter {
            options.filter_eirini_apps = false;
        }
        if self.start_resource_version.is_some() {
            options.watcher_start_resource_version = self.start_resource_version;
        }
        if self.cert_dir.is_some() {
            options.cert_dir = self.cert_dir;
        }
        if self.no_register {
            options.register_webhooks = false;
        }
        if self.kubeconfig.is_some() {
            options.kubeconfig_path = self.kubeconfig;
        }
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("EiriniX v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Info(options) => print_info(options.into_options()?),
        Commands::Run(run_args) => {
            init_tracing();
            let result = run_manager(run_args).await;
            eirinix::telemetry::shutdown_telemetry();
            result
        }
        Commands::Watch(options) => {
            init_tracing();
            let result = run_watch(options.into_options()?).await;
            eirinix::telemetry::shutdown_telemetry();
            result
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");
    let text_layer = (!json).then(|| fmt::layer().with_target(true));
    let json_layer = json.then(|| fmt::layer().json().with_target(true));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer);

    // Only export spans when a collector endpoint is configured
    let otel_enabled = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();

    if otel_enabled {
        let otel_layer = eirinix::telemetry::init_telemetry(&registry);
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
}

async fn run_manager(args: RunArgs) -> Result<(), Error> {
    let options = args.options.into_options()?;
    info!(
        "Starting EiriniX v{} in namespace '{}'",
        env!("CARGO_PKG_VERSION"),
        options.namespace
    );

    let manager = Manager::new(options);
    if let Some(message) = args.sticky_message {
        manager.add_extension(Arc::new(StickyEnvExtension::new(message)))?;
    }
    if args.log_events {
        manager.add_watcher(Arc::new(EventLogWatcher))?;
    }
    if args.annotate_pods {
        manager.add_reconciler(Arc::new(PodAnnotationReconciler::default()))?;
    }

    manager.start().await
}

async fn run_watch(options: ManagerOptions) -> Result<(), Error> {
    let manager = Manager::new(options);
    manager.add_watcher(Arc::new(EventLogWatcher))?;

    let handle = manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping pod watch");
            handle.stop_watch();
        }
    });

    manager.watch().await
}

fn print_info(options: ManagerOptions) -> Result<(), Error> {
    options.validate()?;

    println!("Webhook configuration: {}", options.webhook_configuration_name());
    println!("Certificate secret:    {}", options.certificate_secret_name());
    println!("Certificate directory: {}", options.cert_dir().display());
    match options.webhook_service() {
        Some(service) => println!(
            "Webhook service:       {}/{}",
            options.service_namespace(),
            service
        ),
        None => println!(
            "Webhook URL:           https://{}:{}/{{index}}",
            options.host, options.port
        ),
    }
    if !options.namespace.is_empty() {
        println!(
            "Namespace label:       {}={}",
            options.namespace_label_key(),
            options.namespace
        );
    }
    println!(
        "Pod selector:          {}",
        options.watch_label_selector().unwrap_or_else(|| "<all pods>".to_string())
    );
    Ok(())
}
