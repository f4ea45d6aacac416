use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use replyflow::{
    channel::{HttpChannelClient, RetryPolicy},
    cli::config_path_from_args,
    config::Config,
    engine::forms::PlainTextTranslator,
    ingress::SocketIngress,
    logging::init_tracing,
    pipeline::{PipelineDeps, PipelineFactory},
    resources::HttpResources,
    sinks::{NatsSinks, SinkSubjects},
    statestore::{EventLog, InMemoryEventLog, StateStore},
    supervisor::Supervisor,
    transition::Orchestrator,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path_from_args()?;
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let logging_guard = init_tracing(&config.logging)?;
    tracing::info!(
        target: "main",
        run_id = %logging_guard.run_id(),
        lanes = config.supervisor.lanes,
        "starting"
    );

    let nats = async_nats::connect(&config.sinks.nats_url)
        .await
        .with_context(|| format!("failed to connect to NATS at {}", config.sinks.nats_url))?;
    let sinks = Arc::new(NatsSinks::new(
        nats,
        SinkSubjects {
            state: config.sinks.state_subject.clone(),
            responses: config.sinks.responses_subject.clone(),
            payments: config.sinks.payments_subject.clone(),
            handoffs: config.sinks.handoffs_subject.clone(),
        },
        config.sinks.feedback_url.clone(),
    ));

    let channel = Arc::new(HttpChannelClient::new(
        config.channel.base_url.clone(),
        RetryPolicy {
            retries: config.channel.retries,
            base: config.channel.backoff_base,
            transient_codes: config.channel.transient_codes.clone(),
        },
    ));
    let resources = Arc::new(HttpResources::new(config.resources.base_url.clone()));

    let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::default());
    let store = StateStore::new(
        config.engine.clone(),
        log.clone(),
        config.caches.state_ttl,
        config.statestore.replay_window,
    );
    let orchestrator = Orchestrator::new(
        config.engine.clone(),
        channel,
        resources.clone(),
        resources,
        Arc::new(PlainTextTranslator),
        config.caches.lookup_ttl,
    );
    let deps = Arc::new(PipelineDeps {
        log,
        store,
        orchestrator,
        sinks,
    });

    let lanes = config.supervisor.lanes.max(1);
    let capacity = config.ingress.lane_queue_capacity.max(1);
    let mut senders = Vec::with_capacity(lanes);
    let mut receivers = Vec::with_capacity(lanes);
    for _ in 0..lanes {
        let (tx, rx) = mpsc::channel(capacity);
        senders.push(tx);
        receivers.push(rx);
    }

    let factory = Arc::new(PipelineFactory::new(deps, receivers));
    let supervisor = Supervisor::new(
        factory,
        lanes,
        config.supervisor.max_restarts,
        config.supervisor.restart_window,
        config.supervisor.cooldown,
    );

    let shutdown = CancellationToken::new();
    let ingress = SocketIngress::new(config.ingress.socket_path.clone());
    let ingress_shutdown = shutdown.clone();
    let ingress_task = tokio::spawn(async move { ingress.run(senders, ingress_shutdown).await });
    let supervisor_shutdown = shutdown.clone();
    let mut supervisor_task = tokio::spawn(async move { supervisor.run(supervisor_shutdown).await });

    let mut sigint =
        signal(SignalKind::interrupt()).context("unable to listen for SIGINT (Ctrl+C)")?;
    let mut sigterm = signal(SignalKind::terminate()).context("unable to listen for SIGTERM")?;

    let outcome = tokio::select! {
        _ = sigint.recv() => {
            tracing::info!(target: "main", "received SIGINT");
            Ok(())
        }
        _ = sigterm.recv() => {
            tracing::info!(target: "main", "received SIGTERM");
            Ok(())
        }
        joined = &mut supervisor_task => {
            joined.context("supervisor task join failed")?.map_err(Into::into)
        }
    };

    shutdown.cancel();
    if !supervisor_task.is_finished() {
        supervisor_task
            .await
            .context("supervisor task join failed")?
            .context("supervisor failed during shutdown")?;
    }
    ingress_task
        .await
        .context("ingress task join failed")?
        .context("ingress failed during shutdown")?;

    tracing::info!(target: "main", "stopped");
    outcome
}
