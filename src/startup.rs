// Startup module - boot banner and component status
//
// The supervisor walks the components in boot order and records what
// happened to each one here. The registry is printed once the interface is
// listening, and mirrored into the log so file-only deployments see it too.

use crate::config::{Config, VERSION};

/// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GREEN: &str = "\x1b[32m";
    pub const RED: &str = "\x1b[31m";
    pub const MAGENTA: &str = "\x1b[35m";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureCategory {
    Core,
    Capture,
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureStatus {
    /// Enabled by config, not started yet
    Pending,
    Active,
    /// Turned off by config or skipped at boot
    Disabled,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct FeatureDefinition {
    pub id: &'static str,
    pub category: FeatureCategory,
    pub description: &'static str,
    pub status: FeatureStatus,
    /// Extra context shown after the description (path, counts, reason)
    pub detail: Option<String>,
}

impl FeatureDefinition {
    pub fn core(id: &'static str, description: &'static str) -> Self {
        Self {
            id,
            category: FeatureCategory::Core,
            description,
            status: FeatureStatus::Pending,
            detail: None,
        }
    }

    pub fn optional(
        id: &'static str,
        category: FeatureCategory,
        enabled: bool,
        description: &'static str,
    ) -> Self {
        Self {
            id,
            category,
            description,
            status: if enabled {
                FeatureStatus::Pending
            } else {
                FeatureStatus::Disabled
            },
            detail: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.status, FeatureStatus::Disabled)
    }
}

/// Boot status of every component, in boot order
#[derive(Debug, Clone)]
pub struct StartupRegistry {
    features: Vec<FeatureDefinition>,
}

impl StartupRegistry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            features: config.feature_definitions(),
        }
    }

    fn set(&mut self, id: &str, status: FeatureStatus, detail: Option<String>) {
        match self.features.iter_mut().find(|f| f.id == id) {
            Some(feature) => {
                feature.status = status;
                if detail.is_some() {
                    feature.detail = detail;
                }
            }
            None => tracing::debug!(id, "status for unregistered component"),
        }
    }

    pub fn activate(&mut self, id: &str) {
        self.set(id, FeatureStatus::Active, None);
    }

    pub fn activate_with(&mut self, id: &str, detail: impl Into<String>) {
        self.set(id, FeatureStatus::Active, Some(detail.into()));
    }

    pub fn disable(&mut self, id: &str, reason: impl Into<String>) {
        self.set(id, FeatureStatus::Disabled, Some(reason.into()));
    }

    pub fn fail(&mut self, id: &str, error: impl Into<String>) {
        self.set(id, FeatureStatus::Failed(error.into()), None);
    }

    pub fn get(&self, id: &str) -> Option<&FeatureDefinition> {
        self.features.iter().find(|f| f.id == id)
    }

    pub fn features(&self) -> &[FeatureDefinition] {
        &self.features
    }

    pub fn failures(&self) -> Vec<&FeatureDefinition> {
        self.features
            .iter()
            .filter(|f| matches!(f.status, FeatureStatus::Failed(_)))
            .collect()
    }
}

fn icon(status: &FeatureStatus) -> &'static str {
    match status {
        FeatureStatus::Active => "✓",
        FeatureStatus::Pending => "…",
        FeatureStatus::Disabled => "○",
        FeatureStatus::Failed(_) => "✗",
    }
}

/// Print the startup banner and component status to stdout
pub fn print_startup(config: &Config, registry: &StartupRegistry) {
    use colors::*;

    println!();
    println!("  {BOLD}{CYAN}companion{RESET} {DIM}v{VERSION}{RESET}");
    println!("  {DIM}Local capture of prompts, code changes and terminal activity{RESET}");
    println!();

    match &config.source {
        Some(path) => println!("  {DIM}Config:{RESET} {GREEN}✓{RESET} {}", path.display()),
        None => println!("  {DIM}Config:{RESET} {DIM}(using defaults){RESET}"),
    }
    println!();

    for feature in registry.features() {
        let (color, style) = match feature.status {
            FeatureStatus::Active => (GREEN, ""),
            FeatureStatus::Failed(_) => (RED, ""),
            _ => (DIM, DIM),
        };
        let detail = match (&feature.status, &feature.detail) {
            (FeatureStatus::Failed(e), _) => format!(" {RED}{e}{RESET}"),
            (_, Some(d)) => format!(" {DIM}({d}){RESET}"),
            _ => String::new(),
        };
        println!(
            "    {color}{}{RESET} {style}{:<10}{RESET} {DIM}{}{RESET}{detail}",
            icon(&feature.status),
            feature.id,
            feature.description
        );
    }
    println!();
    println!(
        "  {MAGENTA}▸{RESET} Listening on {BOLD}http://{}{RESET}",
        config.bind_addr()
    );
    println!();
}

/// Mirror the banner into the log
pub fn log_startup(config: &Config, registry: &StartupRegistry) {
    tracing::info!(version = VERSION, "companion starting");
    for feature in registry.features() {
        match &feature.status {
            FeatureStatus::Failed(error) => {
                tracing::error!(component = feature.id, %error, "{}", feature.description)
            }
            status => tracing::info!(
                component = feature.id,
                detail = feature.detail.as_deref().unwrap_or(""),
                "{} {}",
                icon(status),
                feature.description
            ),
        }
    }
    tracing::info!(addr = %config.bind_addr(), "ready");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_tracks_boot_outcomes() {
        let mut config = Config::default();
        config.enable_clipboard = true;
        let mut registry = StartupRegistry::from_config(&config);

        registry.activate_with("store", "./data/companion.db");
        registry.disable("clipboard", "no clipboard on this host");
        registry.fail("terminal", "history file missing");
        registry.activate("nonexistent");

        assert_eq!(registry.get("store").unwrap().status, FeatureStatus::Active);
        assert_eq!(
            registry.get("store").unwrap().detail.as_deref(),
            Some("./data/companion.db")
        );
        assert!(!registry.get("clipboard").unwrap().is_enabled());
        assert_eq!(registry.failures().len(), 1);
        assert_eq!(registry.get("queue").unwrap().status, FeatureStatus::Pending);
    }
}
