//! Minimal runnable example: registers one handler, enqueues a task for it, and runs until
//! Ctrl-C.

use std::sync::Arc;

use serde_json::Map;
use taskbroker::error::Error;
use taskbroker::service_config::Config;
use taskbroker::{Coordinator, Handler};

struct Greet;

#[async_trait::async_trait]
impl Handler for Greet {
    async fn call(&self, kwargs: Map<String, serde_json::Value>) -> Result<(), anyhow::Error> {
        let name = kwargs
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("world");
        println!("hello, {}!", name);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenv::dotenv().ok();

    let config = Config::from_env()?;
    taskbroker::tracing_config::configure("taskbroker-demo", &config.log_level, config.enable_logging);

    let mut coordinator = Coordinator::new(&config)?;
    coordinator
        .register_queue("greetings", Arc::new(Greet), 2, None)
        .await;

    let mut kwargs = Map::new();
    kwargs.insert("name".into(), serde_json::json!("taskbroker"));
    coordinator.enqueue("greetings", kwargs).await?;

    coordinator.run().await
}
