//! Health check command.
//!
//! Queries the health probes and displays component status.

use anyhow::Result;
use clap::Args;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Probe to query
    #[arg(long, default_value = "ready", value_parser = ["live", "ready", "master"])]
    probe: String,
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let (code, health) = client.get_raw(&format!("/health/{}", args.probe)).await?;

    match format {
        OutputFormat::Table => {
            let status = health
                .get("status")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");

            output::print_info(&format!("Probe: {}", args.probe));
            output::print_detail("Status", status);
            output::print_detail("API URL", client.base_url());

            if let Some(components) = health.get("components").and_then(|v| v.as_array()) {
                for comp in components {
                    let name = comp.get("name").and_then(|v| v.as_str()).unwrap_or("?");
                    let comp_status = comp.get("status").and_then(|v| v.as_str()).unwrap_or("?");
                    match comp.get("message").and_then(|v| v.as_str()) {
                        Some(message) => {
                            output::print_detail(name, &format!("{} ({})", comp_status, message))
                        }
                        None => output::print_detail(name, comp_status),
                    }
                }
            }

            if code.is_success() {
                output::print_success("Probe is UP");
            } else {
                output::print_error(&format!("Probe is DOWN ({})", code));
            }
        }
        OutputFormat::Json => output::print_item(&health, format),
    }

    Ok(())
}
