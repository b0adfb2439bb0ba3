//! Feature definitions for StartupRegistry
//!
//! Every component the supervisor boots is listed here, in boot order.
//! Adding a component? Add it here and it shows up in the startup banner.

use super::Config;

impl Config {
    /// All components, with their initial status derived from configuration.
    /// The supervisor updates statuses as each step actually runs.
    pub fn feature_definitions(&self) -> Vec<crate::startup::FeatureDefinition> {
        use crate::startup::{FeatureCategory, FeatureDefinition};

        let backend = if self.database_url.is_some() {
            "Persistence (postgres)"
        } else {
            "Persistence (sqlite)"
        };

        vec![
            // ─────────────────────────────────────────────────────────────────
            // Core (always enabled)
            // ─────────────────────────────────────────────────────────────────
            FeatureDefinition::core("store", backend),
            FeatureDefinition::core("queue", "Sequence queue"),
            FeatureDefinition::core("turns", "Conversation turns"),
            // ─────────────────────────────────────────────────────────────────
            // Capture sources
            // ─────────────────────────────────────────────────────────────────
            FeatureDefinition::optional(
                "watcher",
                FeatureCategory::Capture,
                self.watch,
                "File-change detector",
            ),
            FeatureDefinition::optional(
                "clipboard",
                FeatureCategory::Capture,
                self.enable_clipboard,
                "Clipboard prompts",
            ),
            FeatureDefinition::optional(
                "terminal",
                FeatureCategory::Capture,
                true,
                "Shell history tail",
            ),
            FeatureDefinition::core("sweeper", "Prompt attribution window"),
            // ─────────────────────────────────────────────────────────────────
            // Interface and services
            // ─────────────────────────────────────────────────────────────────
            FeatureDefinition::core("api", "HTTP / SSE / WebSocket"),
            FeatureDefinition::optional(
                "labeling",
                FeatureCategory::Service,
                self.labeling.endpoint.is_some(),
                "Remote labels",
            ),
            FeatureDefinition::optional(
                "backup",
                FeatureCategory::Service,
                self.backup.enabled,
                "Scheduled backups",
            ),
        ]
    }
}
