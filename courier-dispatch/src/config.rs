use serde::Deserialize;

/// How dispatched mail leaves the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Route {
    /// Straight to the upstream provider.
    #[default]
    Direct,
    /// Through the local relay listener, so every message passes its
    /// recipient checks a second time.
    Submission,
}

/// Dispatch settings.
///
/// ```ron
/// Courier (
///     dispatch: (
///         max_concurrency: 32,
///         route: Submission,
///     ),
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DispatchConfig {
    /// Recipient attempts in flight at once for one request (default: 16)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default)]
    pub route: Route,
}

const fn default_max_concurrency() -> usize {
    16
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            route: Route::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults() {
        let config: DispatchConfig = ron::from_str("()").unwrap();
        assert_eq!(config, DispatchConfig::default());
        assert_eq!(config.max_concurrency, 16);
        assert_eq!(config.route, Route::Direct);
    }

    #[test]
    fn overrides() {
        let config: DispatchConfig =
            ron::from_str("(max_concurrency: 2, route: Submission)").unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.route, Route::Submission);
    }
}
