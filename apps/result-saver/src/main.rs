use anyhow::Result;
use gsm_result_saver::{SaverConfig, run};

#[tokio::main]
async fn main() -> Result<()> {
    gsm_telemetry::install("gsm-result-saver")?;
    let config = SaverConfig::from_env()?;
    run(config).await
}
