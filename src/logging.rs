use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "yt_fetch_core=info,yt_fetch=info";

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
/// Logs go to stderr so progress output on stdout stays readable.
pub fn init_tracing() {
    init_tracing_with(false);
}

/// Like [`init_tracing`], with `verbose` raising the default level to debug.
pub fn init_tracing_with(verbose: bool) {
    let default = if verbose {
        "yt_fetch_core=debug,yt_fetch=debug"
    } else {
        DEFAULT_FILTER
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into());

    // a second init is harmless
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice() {
        init_tracing();
        init_tracing_with(true);
        tracing::info!("still fine");
    }
}
