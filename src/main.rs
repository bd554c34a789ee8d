use anyhow::{bail, Context};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use slicestore::config::Config;
use slicestore::model::UtcTime;
use slicestore::volume::{VolumeDeps, Volumes};

const USAGE: &str = "usage: slicestore [list | assign [count] [preferred-type...]]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let config_path = Config::path_from_env();
    let config = Config::load_or_default(config_path.as_deref())?;

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "slicestore",
        "slicestore starting: RUST_LOG='{}', config='{}', volumes='{}', node_id='{}'",
        rust_log,
        config_path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "<defaults>".to_string()),
        config.volumes.path.display(),
        config.volumes.node_id
    );

    let args: Vec<String> = std::env::args().skip(1).collect();
    let volumes = Volumes::open(&config, VolumeDeps::default()).with_context(|| format!("open volumes under {}", config.volumes.path.display()))?;

    let out = match args.first().map(String::as_str) {
        None | Some("list") => {
            let list: Vec<_> = volumes
                .all()
                .iter()
                .map(|v| json!({ "volume": v.metadata(), "drained": v.is_drained() }))
                .collect();
            json!(list)
        }
        Some("assign") => {
            let count = match args.get(1) {
                Some(c) => c.parse::<usize>().with_context(|| format!("invalid count \"{}\"", c))?,
                None => config.assignment.count,
            };
            let preferred: Vec<String> = if args.len() > 2 { args[2..].to_vec() } else { config.assignment.preferred_types.clone() };
            let opened_at = UtcTime::now();
            let ids: Vec<_> = volumes.volumes_for(opened_at, count, &preferred).iter().map(|v| v.id().clone()).collect();
            json!({ "fileOpenedAt": opened_at, "count": count, "preferredTypes": preferred, "volumes": ids })
        }
        Some(other) => {
            volumes.close()?;
            bail!("unknown command \"{}\"\n{}", other, USAGE);
        }
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    volumes.close()?;
    Ok(())
}
