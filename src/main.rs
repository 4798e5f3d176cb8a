use clap::Parser;
use tokio::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sgtsync::cli;
use sgtsync::console::ConsoleClient;
use sgtsync::controller::Reconciler;
use sgtsync::pxgrid::{self, PxGridControl, SESSION_SERVICE};
use sgtsync::settings::{Settings, APP_NAME, APP_VERSION};
use sgtsync::stomp::StompEventSource;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sgtsync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse args and env vars, then the config file
    let args = cli::Cli::parse();
    let settings = Settings::load(&args)?;
    info!("Starting {} {}", APP_NAME, APP_VERSION);

    // Register with the pxGrid controller; a fresh agent account sits in
    // PENDING until an operator approves it
    let control = PxGridControl::new(&settings.pxgrid)?;
    loop {
        let state = control.account_activate().await?;
        if state.is_enabled() {
            break;
        }
        info!(
            state = state.account_state.as_str(),
            "pxgrid account not enabled yet, retrying in 60s"
        );
        tokio::time::sleep(Duration::from_secs(60)).await;
    }

    // Locate the session service, then the pubsub service it publishes on
    let session_service = control.service_lookup(SESSION_SERVICE).await?;
    let pubsub_service_name = session_service.property("wsPubsubService")?.to_string();
    let topic = session_service.property("sessionTopic")?.to_string();

    let pubsub_service = control.service_lookup(&pubsub_service_name).await?;
    let pubsub_node_name = pubsub_service.node_name.clone();
    let ws_url = pubsub_service.property("wsUrl")?.to_string();
    let secret = control.access_secret(&pubsub_node_name).await?;

    // Console session, tenant, tag list, and parent-group sanity check
    let mut console = ConsoleClient::new(settings.console.clone())?;
    console.bootstrap().await?;
    console.validate_parent_groups(&settings.configured_parent_groups())?;

    // Event transport
    let tls = pxgrid::websocket_tls(&settings.pxgrid)?;
    let mut source = StompEventSource::connect(
        &ws_url,
        &settings.pxgrid.nodename,
        &secret,
        &pubsub_node_name,
        &topic,
        tls,
    )
    .await?;

    let mut reconciler = Reconciler::new(
        console,
        settings.console.max_call_rate,
        settings.cache.clone(),
    );
    info!(topic = topic.as_str(), "entering subscribe loop");
    // Runs until the transport fails; the supervisor restarts us and state
    // is re-derived from the console
    reconciler.run(&mut source).await?;

    Ok(())
}
