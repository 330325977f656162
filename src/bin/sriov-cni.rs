use anyhow::Result;
use sriov_cni::commands::run_cni;
use sriov_cni::error::code;
use sriov_cni::types::ErrorResult;
use sriov_cni::SriovError;
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() -> Result<()> {
    // Set up tracing; stdout is reserved for the CNI result
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);

    // Run the CNI plugin
    if let Err(err) = run_cni() {
        error!("CNI plugin error: {:#}", err);

        let code = err
            .downcast_ref::<SriovError>()
            .map(SriovError::code)
            .unwrap_or(code::GENERIC);

        // Output error in CNI format
        let payload = ErrorResult {
            cni_version: "1.0.0".to_string(),
            code,
            msg: err.to_string(),
            details: format!("{:#}", err),
        };
        println!("{}", serde_json::to_string(&payload)?);
        std::process::exit(1);
    }

    Ok(())
}
