//! Preflight checks for configured providers.
//!
//! Reports what this machine and build can do and whether each configured
//! provider is usable, with a fix suggestion for anything that is not.
//! Nothing is installed and no model is loaded.

use instruct_config::{resolve_secret, Config, HostedConfig, LocalConfig, HOSTED_API_KEY_ENV};
use instruct_providers::{Capabilities, Capability, Precision};
use std::path::Path;

/// Result of a preflight check
#[derive(Debug, Clone)]
pub struct PreflightCheck {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub fix_suggestion: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

impl PreflightCheck {
    fn ok(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            message: message.into(),
            fix_suggestion: None,
        }
    }

    fn warning(name: impl Into<String>, message: impl Into<String>, fix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warning,
            message: message.into(),
            fix_suggestion: Some(fix.into()),
        }
    }

    fn error(name: impl Into<String>, message: impl Into<String>, fix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            message: message.into(),
            fix_suggestion: Some(fix.into()),
        }
    }
}

/// Full preflight report
#[derive(Debug)]
pub struct PreflightReport {
    pub capabilities: Capabilities,
    pub default_provider: String,
    /// Config file the report was built from; `None` when running on defaults
    pub config_source: Option<String>,
    pub results: Vec<PreflightCheck>,
}

impl PreflightReport {
    /// Check if all checks passed
    pub fn all_ok(&self) -> bool {
        self.results.iter().all(|r| r.status == CheckStatus::Ok)
    }

    /// Check if there are any errors (not just warnings)
    pub fn has_errors(&self) -> bool {
        self.results.iter().any(|r| r.status == CheckStatus::Error)
    }

    /// Format the report as a human-readable string
    pub fn format_report(&self) -> String {
        let mut output = String::new();
        output.push_str("\n╔══════════════════════════════════════════════════════════════╗\n");
        output.push_str("║                  instruct preflight report                   ║\n");
        output.push_str("╚══════════════════════════════════════════════════════════════╝\n\n");

        output.push_str("📋 **Summary**\n");
        output.push_str(&format!("   Capability: {}\n", self.capabilities.level()));
        output.push_str(&format!(
            "   Local backend compiled in: {}\n",
            yes_no(self.capabilities.local_backend)
        ));
        match &self.capabilities.accelerator {
            Some(accelerator) => output.push_str(&format!(
                "   Accelerator: {} (compute {}.{})\n",
                accelerator.name,
                accelerator.compute_capability.0,
                accelerator.compute_capability.1
            )),
            None => output.push_str("   Accelerator: none detected\n"),
        }
        output.push_str(&format!(
            "   Acceleration runtime: {}\n",
            yes_no(self.capabilities.acceleration_runtime)
        ));
        match &self.config_source {
            Some(path) => output.push_str(&format!("   Config file: {}\n", path)),
            None => output.push_str(&format!(
                "   Config file: none, using defaults (create {})\n",
                Config::user_config_path().display()
            )),
        }
        output.push_str(&format!("   Default provider: {}\n\n", self.default_provider));

        output.push_str("🔍 **Checks**\n\n");

        for result in &self.results {
            let icon = match result.status {
                CheckStatus::Ok => "✅",
                CheckStatus::Warning => "⚠️",
                CheckStatus::Error => "❌",
            };
            output.push_str(&format!("{} **{}**\n", icon, result.name));
            output.push_str(&format!("   {}\n", result.message));

            if let Some(ref fix) = result.fix_suggestion {
                output.push_str(&format!("   💡 Fix: {}\n", fix));
            }
            output.push('\n');
        }

        if self.all_ok() {
            output.push_str("✅ All checks passed.\n");
        } else if self.has_errors() {
            output.push_str("❌ Some providers are not usable. See the fixes above.\n");
        } else {
            output.push_str("⚠️  Usable with warnings.\n");
        }

        output
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Run every check against the process environment.
pub fn run_preflight(config: &Config, capabilities: &Capabilities) -> PreflightReport {
    run_preflight_with_env(config, capabilities, |key| std::env::var(key).ok())
}

/// Run every check, reading environment variables through `env`.
pub fn run_preflight_with_env<F>(
    config: &Config,
    capabilities: &Capabilities,
    env: F,
) -> PreflightReport
where
    F: Fn(&str) -> Option<String>,
{
    let mut results = vec![check_accelerator(capabilities)];

    let mut hosted_names: Vec<&String> = config.providers.hosted.keys().collect();
    hosted_names.sort();
    for name in hosted_names {
        let hosted = &config.providers.hosted[name];
        results.extend(check_hosted(name, hosted, &env));
    }

    let mut local_names: Vec<&String> = config.providers.local.keys().collect();
    local_names.sort();
    if !local_names.is_empty() {
        results.push(check_local_backend(capabilities));
    }
    for name in local_names {
        let local = &config.providers.local[name];
        results.extend(check_local(name, local));
    }

    PreflightReport {
        capabilities: capabilities.clone(),
        default_provider: config.providers.default_provider.clone(),
        config_source: None,
        results,
    }
}

fn check_accelerator(capabilities: &Capabilities) -> PreflightCheck {
    let name = "Hardware acceleration";
    match (capabilities.level(), &capabilities.accelerator) {
        (Capability::Accelerated | Capability::Quantized, Some(accelerator)) => {
            PreflightCheck::ok(name, format!("Using {}", accelerator.name))
        }
        (_, Some(accelerator)) if !capabilities.acceleration_runtime => PreflightCheck::warning(
            name,
            format!("{} detected but this build has no CUDA support", accelerator.name),
            "Rebuild with `--features cuda` to run local models on the GPU",
        ),
        _ => PreflightCheck::ok(name, "No accelerator; local models run on CPU"),
    }
}

fn check_local_backend(capabilities: &Capabilities) -> PreflightCheck {
    let name = "Local backend";
    if capabilities.local_backend {
        PreflightCheck::ok(name, "llama.cpp backend compiled in")
    } else {
        PreflightCheck::error(
            name,
            "Local providers are configured but no local backend is compiled in",
            "Rebuild with `--features llama` (or `--features cuda`)",
        )
    }
}

fn check_hosted<F>(name: &str, config: &HostedConfig, env: &F) -> Vec<PreflightCheck>
where
    F: Fn(&str) -> Option<String>,
{
    let label = format!("hosted.{}", name);
    let mut results = Vec::new();

    match resolve_secret(Some(config.api_key.as_str()), env(HOSTED_API_KEY_ENV)) {
        Some(_) if !config.api_key.is_empty() => {
            results.push(PreflightCheck::ok(&label, "API key configured"))
        }
        Some(_) => results.push(PreflightCheck::ok(
            &label,
            format!("API key taken from {}", HOSTED_API_KEY_ENV),
        )),
        None => results.push(PreflightCheck::error(
            &label,
            "No API key configured",
            format!(
                "Set `api_key` under [providers.hosted.{}] or export {}",
                name, HOSTED_API_KEY_ENV
            ),
        )),
    }

    if let Some(temperature) = config.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            results.push(PreflightCheck::error(
                &label,
                format!("Temperature {} is outside [0, 2]", temperature),
                "Use a temperature between 0 and 2",
            ));
        }
    }

    results
}

fn check_local(name: &str, config: &LocalConfig) -> Vec<PreflightCheck> {
    let label = format!("local.{}", name);
    let mut results = Vec::new();

    let expanded = shellexpand::tilde(&config.model_path).to_string();
    if Path::new(&expanded).is_file() {
        results.push(PreflightCheck::ok(&label, format!("Model file {}", expanded)));
    } else if looks_like_path(&config.model_path) {
        results.push(PreflightCheck::error(
            &label,
            format!("Model file not found: {}", expanded),
            format!("Point `model_path` under [providers.local.{}] at a GGUF file", name),
        ));
    } else {
        results.push(PreflightCheck::warning(
            &label,
            format!("'{}' is a model id, not a local file", config.model_path),
            "Download a GGUF build of the model and set `model_path` to its path",
        ));
    }

    if let Some(precision) = &config.precision {
        if let Err(e) = precision.parse::<Precision>() {
            results.push(PreflightCheck::error(
                &label,
                e.to_string(),
                "Use one of bfloat16, float16 or float32",
            ));
        }
    }

    results
}

fn looks_like_path(model_path: &str) -> bool {
    model_path.starts_with('/')
        || model_path.starts_with('.')
        || model_path.starts_with('~')
        || model_path.ends_with(".gguf")
}
