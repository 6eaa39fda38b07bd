use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant, sleep};
use tracing_subscriber::EnvFilter;

use hive_core::app::{SwarmBuilder, WorkOutcome, WorkerAgent};
use hive_core::config::HiveConfig;
use hive_core::domain::{NewTask, Priority, ReviewOutcome, Task, TaskId, WorkerId};

/// タスク description の JSON 部分
#[derive(Debug, Deserialize)]
struct Chore {
    name: String,
    #[serde(default)]
    flaky: bool,
}

/// デモ用 agent: description を JSON として読み、flaky な作業は 1 回目だけ差し戻す
struct DemoAgent {
    name: String,
    reviewed: Mutex<HashMap<TaskId, u32>>,
}

impl DemoAgent {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            reviewed: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl WorkerAgent for DemoAgent {
    async fn work(&self, task: &Task) -> WorkOutcome {
        match serde_json::from_str::<Chore>(&task.description) {
            Ok(chore) => {
                sleep(Duration::from_millis(50)).await;
                println!("[{}] done: {}", self.name, chore.name);
                WorkOutcome::Done {
                    note: Some(format!("{} finished by {}", chore.name, self.name)),
                }
            }
            Err(e) => WorkOutcome::Failed {
                reason: format!("json decode: {e}"),
            },
        }
    }

    async fn review(&self, task: &Task) -> (ReviewOutcome, Option<String>) {
        let flaky = serde_json::from_str::<Chore>(&task.description).is_ok_and(|c| c.flaky);
        let seen = {
            let mut reviewed = self.reviewed.lock().unwrap_or_else(|p| p.into_inner());
            let n = reviewed.entry(task.id).or_insert(0);
            *n += 1;
            *n
        };
        if flaky && seen == 1 {
            (ReviewOutcome::Rejected, Some(format!("{}: needs another pass", self.name)))
        } else {
            (ReviewOutcome::Approved, Some(format!("{}: lgtm", self.name)))
        }
    }
}

fn demo_config() -> HiveConfig {
    let mut config = HiveConfig::default();
    config.lease.sweep_interval_ms = 200;
    config.presence.heartbeat_interval_ms = 100;
    config.election.cycle_ms = 500;
    config.election.every_cycles = 2;
    config.election.grace_secs = 0;
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("HIVE_LOG").unwrap_or_else(|_| EnvFilter::new("hive_core=info")),
        )
        .init();

    // (A) 設定: 引数に TOML のパスがあれば読む
    let config = match std::env::args().nth(1) {
        Some(path) => HiveConfig::load(path)?,
        None => demo_config(),
    };

    // (B) swarm を組み立ててバックグラウンドループを起動
    let swarm = Arc::new(SwarmBuilder::new(config).build().await?);
    swarm.start()?;

    // (C) worker を 3 体（review には自分以外の 2 体が必要）
    for (name, tags) in [("ada", ["rust", "docs"]), ("bob", ["rust", "ops"]), ("cyd", ["rust", "ops"])] {
        let tags: BTreeSet<String> = tags.iter().map(|t| t.to_string()).collect();
        swarm
            .spawn_worker(WorkerId::new(name), tags, Arc::new(DemoAgent::new(name)))
            .await?;
    }

    // (D) タスク投入
    let gateway = swarm.gateway();
    let parser = gateway
        .create(
            NewTask::new(r#"{"name":"write parser"}"#)
                .with_tag("rust")
                .with_priority(Priority::High)
                .with_review(),
            None,
        )
        .await?;
    gateway
        .create(
            NewTask::new(r#"{"name":"document parser","flaky":true}"#)
                .with_tag("rust")
                .with_tag("docs")
                .depends_on(parser)
                .with_review(),
            None,
        )
        .await?;
    gateway
        .create(NewTask::new(r#"{"name":"rotate logs"}"#).with_tag("ops"), None)
        .await?;
    tracing::info!(tasks = 3, "demo tasks queued");

    // (E) 全タスクが終わるまでポーリング
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let status = swarm.status().await?;
        if status.outstanding() == 0 || Instant::now() >= deadline {
            println!("{}", serde_json::to_string_pretty(&status)?);
            break;
        }
        sleep(Duration::from_millis(200)).await;
    }

    swarm.shutdown().await;
    Ok(())
}
