//! Registers a global [`tracing`] subscriber for every binary in the
//! workspace, honoring `RUST_LOG` on top of a component-supplied default.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Installs a process-wide subscriber. `default_directives` is used when
/// `RUST_LOG` is unset (e.g. `"netsat_agent=info,netsat_net=debug"`).
pub fn setup_global_subscriber(default_directives: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives))
        .context("failed to parse log directives")?;

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .try_init()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
    }

    Ok(())
}

/// Formats an [`anyhow::Error`]'s full source chain, one `caused by:` per
/// line, matching the teacher's `err_with_src` convention.
pub fn err_with_src(err: &anyhow::Error) -> String {
    use std::fmt::Write;

    let mut out = format!("{err}");
    for cause in err.chain().skip(1) {
        let _ = write!(out, "\n  caused by: {cause}");
    }

    out
}
