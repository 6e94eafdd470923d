use anyhow::Context as _;

pub const LOG_ENV: &str = "DRAFTSYNC_LOG";

/// Installs the stderr subscriber.
///
/// `DRAFTSYNC_LOG` takes precedence, then `RUST_LOG`, then `default_directive`.
/// Stdout stays reserved for command output.
pub fn init(default_directive: &str) -> anyhow::Result<()> {
    let filter = match std::env::var(LOG_ENV) {
        Ok(directives) if !directives.trim().is_empty() => {
            tracing_subscriber::EnvFilter::try_new(&directives)
                .with_context(|| format!("invalid {LOG_ENV}={directives:?}"))?
        }
        _ => tracing_subscriber::EnvFilter::try_from_default_env()
            .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_directive))
            .context("build log filter")?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}
