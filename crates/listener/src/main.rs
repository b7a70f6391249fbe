use color_eyre::eyre::eyre;
use kn_alert_listener::AppResources;
use kn_alert_listener::broker::BrokerClient;
use kn_alert_listener::config::{AppConfig, ConfigError, SourceKind, load_config};
use kn_alert_listener::error::ListenerError;
use kn_alert_listener::notify::{EmailNotifier, Notifier, OperatorChannel};
use kn_alert_listener::scheduler::{PollingScheduler, report_crash};
use kn_alert_listener::source::{AlertSource, ReplaySource};
use lettre::{AsyncSmtpTransport, Tokio1Executor, transport::smtp::authentication::Credentials};
use rustls::crypto;
use rustls::crypto::CryptoProvider;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn initialize_tracing() {
    let default_directives = "kn_alert_listener=info,hyper=warn,rdkafka=warn";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_target(true).with_level(true);

    registry.with(layer).init();
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown host".to_string())
}

fn open_source(config: &AppConfig) -> Result<Box<dyn AlertSource>, ListenerError> {
    let topic = config
        .polling
        .consumer
        .topics
        .first()
        .cloned()
        .unwrap_or_default();
    match config.source.kind {
        SourceKind::Replay => Ok(Box::new(ReplaySource::open(&config.replay_dir(), topic)?)),
        #[cfg(feature = "kafka")]
        SourceKind::Kafka => {
            let kafka = config.kafka.as_ref().ok_or_else(|| {
                ConfigError::Validation("source.kind is kafka but no kafka section".into())
            })?;
            let source = kn_alert_listener::source::kafka::KafkaAlertSource::connect(
                kafka,
                &config.polling.consumer.topics,
            )?;
            Ok(Box::new(source))
        }
        #[cfg(not(feature = "kafka"))]
        SourceKind::Kafka => Err(ConfigError::Validation(
            "source.kind is kafka but this build lacks the `kafka` feature".into(),
        )
        .into()),
    }
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    // A missing .env is fine, everything can come from the environment.
    let _ = dotenvy::dotenv();
    initialize_tracing();

    let config = Arc::new(load_config()?);
    let test_mode = config.resolve_test_mode();
    if test_mode {
        tracing::warn!("YOU ARE IN TEST MODE");
    }

    CryptoProvider::install_default(crypto::ring::default_provider())
        .map_err(|_| eyre!("Failed to install crypto provider"))?;

    // Set up lettre SMTP client
    let creds = Credentials::new(config.smtp.username.clone(), config.smtp.password.clone());
    let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp.server)?
        .port(config.smtp.port)
        .credentials(creds)
        .build();
    let notifier: Arc<dyn Notifier> = Arc::new(EmailNotifier::new(mailer, &config.smtp.from)?);
    let operators = OperatorChannel::from_config(notifier.clone(), &config.operators, test_mode);

    if let Err(e) = config.check_required_files() {
        operators
            .report(&format!("cannot start: {e}"), Level::ERROR)
            .await;
        return Err(e.into());
    }

    let resources = AppResources {
        config: config.clone(),
        notifier,
        history: Arc::new(BrokerClient::new(&config.broker)?),
        test_mode,
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    operators
        .report(&format!("starting bot on {}", host_name()), Level::INFO)
        .await;

    let source = match open_source(&config) {
        Ok(source) => source,
        Err(e) => return Err(report_crash(&operators, e.into()).await),
    };
    PollingScheduler::new(source, resources.processor(), &config.polling, cancel)
        .supervise(&operators)
        .await
}
