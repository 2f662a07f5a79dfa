use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use loopback_broker::{LoopbackBroker, SCHEME};
use relay_api::{DeadLetter, Delivery, Message, PartitionId};
use relay_client::{
    ConnectionManager, Consumer, DeadLetterMode, HandlerError, LogDeadLetter, Outcome,
    PublishOptions, Publisher, SubscribeOptions, Subscription, TopicDeadLetter,
    open_offset_store,
};

use crate::config::{self, DemoArgs};
use crate::error::CliError;

pub async fn run(args: DemoArgs) -> Result<(), CliError> {
    tracing::info!("relay demo starting");

    // --- Config ---
    let mut config = config::load(args.config.as_deref())?;
    if let Some(group) = &args.group {
        config.consumer.group_id = group.clone();
    }
    config.validate()?;
    if args.partitions == 0 {
        return Err(CliError::Args("--partitions must be > 0".into()));
    }
    if args.keys == 0 {
        return Err(CliError::Args("--keys must be > 0".into()));
    }

    // --- Broker + connection ---
    let broker = LoopbackBroker::new();
    broker.create_topic(&args.topic, args.partitions);
    let dlq_topic = format!("{}{}", args.topic, config.dead_letter.suffix);
    broker.create_topic(&dlq_topic, 1);

    let endpoint = if config.endpoint.starts_with(SCHEME) {
        config.endpoint.clone()
    } else {
        tracing::warn!(endpoint = %config.endpoint, "demo runs on the loopback broker only, endpoint ignored");
        format!("{SCHEME}demo")
    };
    let manager = Arc::new(
        ConnectionManager::connect(endpoint, Arc::new(broker.clone()), config.backoff.clone()).await?,
    );

    let publisher = Arc::new(Publisher::new(manager.clone(), config.publisher.clone()));
    let offsets = open_offset_store(&config.offsets, &config.consumer.group_id)?;
    let dead_letter: Arc<dyn DeadLetter> = match config.dead_letter.mode {
        DeadLetterMode::Log => Arc::new(LogDeadLetter),
        DeadLetterMode::Topic => Arc::new(TopicDeadLetter::new(
            publisher.clone(),
            config.dead_letter.suffix.clone(),
        )),
    };
    let consumer = Consumer::new(manager.clone(), offsets).with_dead_letter(dead_letter);

    // --- Publish ---
    let mut pending = Vec::with_capacity(args.messages as usize);
    for seq in 0..args.messages {
        let key = format!("key-{}", seq % args.keys);
        let message = Message::json(&serde_json::json!({ "seq": seq, "key": key }))?.with_key(key);
        pending.push(publisher.publish(&args.topic, message, PublishOptions::new()).await);
    }
    for delivery in pending {
        let receipt = delivery.await?;
        tracing::debug!(partition = ?receipt.partition(), offset = ?receipt.offset(), "published");
    }
    tracing::info!(topic = %args.topic, messages = args.messages, keys = args.keys, "published");

    // --- Consume ---
    let handled = Arc::new(AtomicU64::new(0));
    let fail_every = args.fail_every.filter(|n| *n > 0);
    let handler = {
        let handled = handled.clone();
        move |delivery: Delivery| {
            let n = handled.fetch_add(1, Ordering::Relaxed) + 1;
            let fail = fail_every.is_some_and(|k| n % k == 0);
            async move {
                if fail {
                    tracing::info!(message = %delivery.id, delivery_count = delivery.delivery_count, "demo nack");
                    return Ok::<Outcome, HandlerError>(Outcome::retry());
                }
                tracing::debug!(message = %delivery.id, payload = %String::from_utf8_lossy(delivery.message.payload()), "handled");
                Ok(Outcome::Ack)
            }
        }
    };
    let options = SubscribeOptions::from(&config.consumer);
    let sub = consumer.subscribe(&[args.topic.as_str()], handler, options).await?;

    let ends: Vec<(PartitionId, u64)> = sub
        .partitions()
        .iter()
        .map(|p| (p.clone(), broker.records(&p.topic, p.partition).len() as u64))
        .collect();
    let caught_up = wait_caught_up(&sub, &ends, Duration::from_secs(args.timeout_secs)).await;

    // --- Report ---
    let stats = sub.stats();
    let cursors: Vec<(PartitionId, Option<u64>)> = ends
        .iter()
        .map(|(p, _)| (p.clone(), sub.committed(p)))
        .collect();
    sub.cancel().await?;
    publisher.close().await;
    manager.close().await;

    println!("group: {}", config.consumer.group_id);
    for ((partition, cursor), (_, end)) in cursors.iter().zip(&ends) {
        match cursor {
            Some(c) => println!("  {partition}: cursor {c} (log end {end})"),
            None => println!("  {partition}: no cursor (log end {end})"),
        }
    }
    println!("handler calls: {}", handled.load(Ordering::Relaxed));
    println!("{}", serde_json::to_string_pretty(&stats)?);
    let dead = broker.records(&dlq_topic, 0).len();
    if dead > 0 {
        println!("dead-letter topic {dlq_topic}: {dead} messages");
    }

    if caught_up {
        Ok(())
    } else {
        Err(CliError::Timeout(args.timeout_secs))
    }
}

/// Wait until every partition's cursor reached its log end, Ctrl-C, or `timeout`.
async fn wait_caught_up(sub: &Subscription, ends: &[(PartitionId, u64)], timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let done = ends
            .iter()
            .all(|(p, end)| *end == 0 || sub.committed(p).is_some_and(|c| c + 1 >= *end));
        if done {
            return true;
        }
        if Instant::now() >= deadline {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "consumer did not catch up");
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                return true;
            }
        }
    }
}
