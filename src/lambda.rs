use anyhow::anyhow;
use fpl_pipeline::jobs::{self, Job};
use fpl_pipeline::notify::Mailer;
use fpl_pipeline::{APP_NAME, Config, JOB_VAR, set_up_logger};
use lambda_runtime::{LambdaEvent, service_fn};
use log::{debug, info};
use serde_json::Value;
use std::env;
use std::error::Error;

type LambdaError = Box<dyn Error + Send + Sync + 'static>;

#[tokio::main]
async fn main() -> Result<(), LambdaError> {
    let func = service_fn(function);
    lambda_runtime::run(func).await?;
    Ok(())
}

/// The job comes from the function's environment, or from a `job` field on the scheduled event
/// when one function serves several schedules.
fn job_for(payload: &Value) -> anyhow::Result<Job> {
    env::var(JOB_VAR)
        .ok()
        .or_else(|| payload.get("job").and_then(Value::as_str).map(String::from))
        .ok_or_else(|| anyhow!("No job named by {} or the event", JOB_VAR))?
        .parse()
}

async fn function(event: LambdaEvent<Value>) -> Result<Value, LambdaError> {
    set_up_logger(module_path!(), false)?;
    info!(
        "{} {} built with rustc {}",
        APP_NAME,
        env!("CARGO_PKG_VERSION"),
        env!("RUSTC_VERSION")
    );
    debug!("Processing event: {:?}", event);

    let job = job_for(&event.payload)?;
    let config = Config::from_env();
    let mailer = match &config {
        Ok(config) => Mailer::new(config).await,
        Err(_) => Mailer::new(&Config::from_env_with_default_league()).await,
    };

    let outcome = jobs::run_loaded(job, config, &mailer).await;

    Ok(outcome.to_json())
}
