//! Log output
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_FILTER: &str = "incident_lifecycle=info";

/// Installs the global fmt subscriber, filtered by `RUST_LOG`.
///
/// Returns `false` when a subscriber was already installed, which happens
/// when tests or an embedding server got there first.
pub fn init_tracing() -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_install_is_harmless() {
        let _ = init_tracing();
        assert!(!init_tracing());
    }
}
