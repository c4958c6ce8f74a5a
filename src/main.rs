use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use anyhow::{bail, Context};
use base64::Engine;
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::info;

use pomerium_ingress_controller::controllers::{
    Pipeline, Settings, State, DEFAULT_ANNOTATION_PREFIX, DEFAULT_CLASS_CONTROLLER_NAME,
};
use pomerium_ingress_controller::databroker::applier::DatabrokerApplier;
use pomerium_ingress_controller::databroker::lease::Leaser;
use pomerium_ingress_controller::databroker::{GrpcStore, StoreOptions};
use pomerium_ingress_controller::model::ObjectKey;
pub use pomerium_ingress_controller::{telemetry, Metrics};

#[derive(Debug, clap::Parser)]
#[command(name = "pomerium-ingress-controller", about = "run ingress controller")]
struct Arguments {
    /// The address the metric endpoint binds to.
    #[arg(
        long = "metrics-bind-address",
        env = "METRICS_BIND_ADDRESS",
        default_value = ":8080"
    )]
    metrics_bind_address: String,

    /// The address the probe endpoint binds to.
    #[arg(
        long = "health-probe-bind-address",
        env = "HEALTH_PROBE_BIND_ADDRESS",
        default_value = ":8081"
    )]
    health_probe_bind_address: String,

    /// Reserved for the admission webhook.
    #[arg(long = "webhook-port", env = "WEBHOOK_PORT", default_value_t = 9443)]
    #[allow(dead_code)]
    webhook_port: u16,

    /// IngressClass controller name
    #[arg(long = "name", env = "NAME", default_value = DEFAULT_CLASS_CONTROLLER_NAME)]
    name: String,

    /// Ingress annotation prefix
    #[arg(long = "prefix", env = "PREFIX", default_value = DEFAULT_ANNOTATION_PREFIX)]
    prefix: String,

    /// Namespaces to watch, or none to watch all namespaces
    #[arg(long = "namespaces", env = "NAMESPACES", value_delimiter = ',')]
    namespaces: Vec<String>,

    /// The databroker service url
    #[arg(
        long = "databroker-service-url",
        env = "DATABROKER_SERVICE_URL",
        default_value = "http://localhost:5443"
    )]
    databroker_service_url: String,

    /// TLS CA file path
    #[arg(long = "databroker-tls-ca-file", env = "DATABROKER_TLS_CA_FILE")]
    databroker_tls_ca_file: Option<PathBuf>,

    /// Base64 encoded TLS CA
    #[arg(long = "databroker-tls-ca", env = "DATABROKER_TLS_CA")]
    databroker_tls_ca: Option<String>,

    /// Disable remote hosts TLS certificate chain and hostname check for the
    /// databroker connection
    #[arg(
        long = "databroker-tls-insecure-skip-verify",
        env = "DATABROKER_TLS_INSECURE_SKIP_VERIFY"
    )]
    databroker_tls_insecure_skip_verify: bool,

    /// Override the certificate name used for the databroker connection
    #[arg(
        long = "databroker-tls-override-certificate-name",
        env = "DATABROKER_TLS_OVERRIDE_CERTIFICATE_NAME"
    )]
    databroker_tls_override_certificate_name: Option<String>,

    /// Base64-encoded shared secret for signing JWTs
    #[arg(long = "shared-secret", env = "SHARED_SECRET")]
    shared_secret: Option<String>,

    /// Update ingress status from given service status (pomerium-proxy)
    #[arg(long = "update-status-from-service", env = "UPDATE_STATUS_FROM_SERVICE")]
    update_status_from_service: Option<String>,

    /// This flag should only be set if pomerium is configured with the
    /// insecure_server option
    #[arg(long = "disable-cert-check", env = "DISABLE_CERT_CHECK")]
    disable_cert_check: bool,

    #[arg(long = "debug", env = "DEBUG", hide = true)]
    debug: bool,
}

impl Arguments {
    fn settings(&self) -> anyhow::Result<Settings> {
        let update_status_from_service = match &self.update_status_from_service {
            Some(value) => {
                let key: ObjectKey = value
                    .parse()
                    .map_err(|e| anyhow::anyhow!("update-status-from-service: {e}"))?;
                if key.namespace.is_empty() {
                    bail!("service name must be in namespace/name format");
                }
                Some(key)
            }
            None => None,
        };
        Ok(Settings {
            controller_name: self.name.clone(),
            annotation_prefix: self.prefix.clone(),
            namespaces: self.namespaces.clone(),
            disable_cert_check: self.disable_cert_check,
            update_status_from_service,
        })
    }

    fn store_options(&self) -> anyhow::Result<StoreOptions> {
        let tls_ca = match (&self.databroker_tls_ca_file, &self.databroker_tls_ca) {
            (Some(path), _) => Some(
                std::fs::read(path)
                    .with_context(|| format!("reading tls CA file {}", path.display()))?,
            ),
            (None, Some(encoded)) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .context("databroker-tls-ca must be base64")?,
            ),
            (None, None) => None,
        };
        let shared_secret = self
            .shared_secret
            .as_deref()
            .map(StoreOptions::decode_shared_secret)
            .transpose()
            .context("shared-secret must be base64")?;
        Ok(StoreOptions {
            service_url: self.databroker_service_url.clone(),
            tls_ca,
            tls_insecure_skip_verify: self.databroker_tls_insecure_skip_verify,
            tls_override_certificate_name: self.databroker_tls_override_certificate_name.clone(),
            shared_secret,
        })
    }
}

/// `:8080` style flag values bind on all interfaces.
fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Lease holder identity, unique per process start.
fn instance_identity() -> String {
    let host = std::env::var("HOSTNAME")
        .unwrap_or_else(|_| "pomerium-ingress-controller".to_string());
    format!("{host}-{:08x}", rand::random::<u32>())
}

#[get("/metrics")]
async fn metrics(c: Data<Arc<State>>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&metrics, &mut buffer).unwrap();
    HttpResponse::Ok().body(buffer)
}

#[get("/healthz")]
async fn healthz(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().body("ok")
}

#[get("/readyz")]
async fn readyz(c: Data<Arc<State>>, _req: HttpRequest) -> impl Responder {
    if c.is_running() {
        HttpResponse::Ok().body("ok")
    } else {
        HttpResponse::ServiceUnavailable().body("waiting for databroker lease")
    }
}

#[get("/")]
async fn index(c: Data<Arc<State>>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Arguments::parse();
    telemetry::init(args.debug);

    let settings = args.settings()?;
    let store_opts = args.store_options()?;
    let store = Arc::new(GrpcStore::connect(&store_opts).await?);

    let state = Arc::new(State::new());
    let metric = Metrics::default().register(&state.registry)?;
    let applier = Arc::new(DatabrokerApplier::new(store.clone()));
    let pipeline = Arc::new(Pipeline {
        settings,
        applier,
        state: state.clone(),
        metrics: metric,
    });

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    let leaser = Leaser::new(store, instance_identity());
    let lease_loop = leaser.run(pipeline, shutdown.clone());

    let probe_state = state.clone();
    let probe_server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(probe_state.clone()))
            .wrap(
                middleware::Logger::default()
                    .exclude("/healthz")
                    .exclude("/readyz"),
            )
            .service(healthz)
            .service(readyz)
    })
    .bind(bind_addr(&args.health_probe_bind_address))?
    .shutdown_timeout(5)
    .run();

    let metrics_state = state.clone();
    let metrics_server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(metrics_state.clone()))
            .service(index)
            .service(metrics)
    })
    .bind(bind_addr(&args.metrics_bind_address))?
    .shutdown_timeout(5)
    .run();

    tokio::pin!(lease_loop);
    tokio::pin!(probe_server);
    tokio::pin!(metrics_server);

    // all three implement graceful shutdown, so poll until all are done
    let (lease_result, probe_result, metrics_result) =
        tokio::join!(lease_loop, probe_server, metrics_server);
    probe_result?;
    metrics_result?;
    lease_result?;
    Ok(())
}
