use leadership::{
    ElectionConfig, ElectionOptions, ElectionStatus, InMemoryBackend, LeaderElection, LeadershipListener,
    ListenerError,
};
use slog::Drain;
use std::error::Error;
use std::sync::Arc;
use tokio::time::Duration;

struct LoggingListener {
    logger: slog::Logger,
}

impl LeadershipListener for LoggingListener {
    fn on_elected(&self) -> Result<(), ListenerError> {
        slog::info!(self.logger, "I am the leader now");
        Ok(())
    }

    fn on_revoked(&self) -> Result<(), ListenerError> {
        slog::info!(self.logger, "I am no longer the leader");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let root_logger = create_root_logger_for_stdout();
    let backend = InMemoryBackend::new();

    let mut elections = Vec::with_capacity(3);
    for i in 1..=3 {
        let hostname = format!("candidate-{}", i);
        let logger = root_logger.new(slog::o!("Host" => hostname.clone()));
        let election = leadership::try_create_election(ElectionConfig {
            backend: Arc::new(backend.connect()),
            info_logger: logger.clone(),
            options: options(hostname),
            listeners: vec![Arc::new(LoggingListener { logger })],
            info_provider: None,
        })
        .await?;
        election.start().await?;
        elections.push(election);
    }

    let leader = wait_for_leader(&elections, Duration::from_secs(5)).await?;
    slog::info!(root_logger, "Elected: {:?}", elections[leader].status().leader);

    slog::info!(root_logger, "Stopping the leader");
    elections[leader].stop().await?;
    let survivors: Vec<LeaderElection> = elections
        .into_iter()
        .enumerate()
        .filter(|(i, _)| *i != leader)
        .map(|(_, election)| election)
        .collect();

    let next_leader = wait_for_leader(&survivors, Duration::from_secs(5)).await?;
    slog::info!(root_logger, "Handed over to: {:?}", survivors[next_leader].status().leader);

    for election in &survivors {
        election.stop().await?;
    }
    // Let the async drain flush.
    tokio::time::sleep(Duration::from_millis(100)).await;

    Ok(())
}

fn options(hostname: String) -> ElectionOptions {
    ElectionOptions {
        service_name: Some("demo".into()),
        session_ttl: Some(Duration::from_secs(3)),
        session_renewal_interval: Some(Duration::from_secs(1)),
        session_lock_delay: Some(Duration::from_secs(0)),
        operation_timeout: Some(Duration::from_millis(500)),
        watch_timeout: Some(Duration::from_secs(2)),
        retry_initial_interval: Some(Duration::from_millis(100)),
        retry_max_interval: Some(Duration::from_secs(1)),
        hostname: Some(hostname),
        cluster_name: Some("demo-cluster".into()),
        ..ElectionOptions::default()
    }
}

async fn wait_for_leader(elections: &[LeaderElection], timeout: Duration) -> Result<usize, Box<dyn Error>> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Some(i) = elections
            .iter()
            .position(|e| e.status().status == ElectionStatus::Leader)
        {
            return Ok(i);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Err("no leader elected".into())
}

fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}
