use anyhow::Result;
use remind_claims::{ClaimScheduler, Reaper};
use remind_core::config::DispatchMode;
use remind_core::db::run_migrations;
use remind_core::{ChannelQueue, Config, JobQueue, RedpandaQueue, RemindContext};
use remind_delivery::{consumer, pool, DeliveryWorker, RedisFollowupLog, TwilioGateway};
use remind_digest::DigestScheduler;
use remind_recurring::Expander;
use std::future::Future;
use std::sync::Arc;
use tokio;
use tracing;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn spawn_loop<F>(name: &'static str, task: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = task.await {
            tracing::error!("{} stopped: {}", name, e);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    tracing::info!("Starting reminder delivery engine");

    let config = Config::from_env();
    config.scheduling.validate()?;
    run_migrations(&config.database).await?;

    let ctx = RemindContext::new(config).await?;
    let scheduling = ctx.config.scheduling.clone();
    let store = Arc::new(ctx.store());

    tracing::info!("Remind context initialized");

    let gateway = Arc::new(TwilioGateway::new(&ctx.config.sms, scheduling.gateway_timeout)?);
    let followups = Arc::new(RedisFollowupLog::new(
        ctx.redis_pool.clone(),
        scheduling.followup_window,
    ));
    let worker = Arc::new(DeliveryWorker::new(
        store.clone(),
        gateway.clone(),
        followups,
        &scheduling,
    ));

    let queue: Arc<dyn JobQueue> = match ctx.config.dispatch.mode {
        DispatchMode::Redpanda => {
            let consumer = ctx.create_consumer(None)?;
            let topic = ctx.config.dispatch.topic.clone();
            let workers = ctx.config.dispatch.delivery_workers;
            let worker = worker.clone();
            spawn_loop("Delivery consumer", async move {
                consumer::run(consumer, &topic, worker, workers).await
            });
            Arc::new(RedpandaQueue::new(
                ctx.redpanda_producer.clone(),
                ctx.config.dispatch.topic.clone(),
            ))
        }
        DispatchMode::Local => {
            let (queue, receiver) = ChannelQueue::new(ctx.config.dispatch.local_queue_capacity);
            spawn_loop(
                "Local delivery pool",
                pool::run(worker.clone(), receiver, ctx.config.dispatch.delivery_workers),
            );
            Arc::new(queue)
        }
    };

    spawn_loop(
        "Claim scheduler",
        ClaimScheduler::new(store.clone(), queue, &scheduling).run(),
    );
    spawn_loop("Stale-claim reaper", Reaper::new(store.clone(), &scheduling).run());
    spawn_loop(
        "Recurrence expander",
        Expander::new(store.clone(), &scheduling).run(),
    );
    spawn_loop(
        "Daily digest scheduler",
        DigestScheduler::new(store.clone(), store.clone(), gateway, &scheduling).run(),
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    Ok(())
}
