/// Build-time version metadata for the engine binary.
///
/// The engine injects this into every step's resolved environment under
/// the `SRC_CLI_VERSION_ENV` key (spec.md §6) so that step containers can
/// observe which engine version produced them.

/// The environment variable name the engine sets on every step container.
pub const SRC_CLI_VERSION_ENV: &str = "SRC_CLI_VERSION";

/// Build/version metadata for the engine.
#[derive(Debug, Clone)]
pub struct EngineVersion;

impl EngineVersion {
    /// The semantic version of the engine.
    /// Pulled from `CARGO_PKG_VERSION`, set by Cargo from `Cargo.toml`.
    pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

    /// The commit hash this binary was built from.
    /// Set via the `BATCHEXEC_COMMIT_HASH` env var at compile time, or "N/A".
    pub const COMMIT_HASH: &'static str = match option_env!("BATCHEXEC_COMMIT_HASH") {
        Some(h) => h,
        None => "N/A",
    };

    /// The string placed into a step container's `SRC_CLI_VERSION` variable.
    pub fn identifier() -> String {
        format!("{}+{}", Self::VERSION, Self::COMMIT_HASH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!EngineVersion::VERSION.is_empty());
    }

    #[test]
    fn commit_hash_has_default() {
        assert!(!EngineVersion::COMMIT_HASH.is_empty());
    }

    #[test]
    fn identifier_combines_version_and_hash() {
        let id = EngineVersion::identifier();
        assert!(id.contains(EngineVersion::VERSION));
    }
}
