//! Config command - defaults and validation

use super::{load_config, section};
use anyhow::Result;
use faultline::config::{config_path, CONFIG_ENV};
use faultline::{FaultlineConfig, Severity};
use owo_colors::OwoColorize;
use std::path::Path;

pub fn print_default() -> Result<()> {
    print!("{}", FaultlineConfig::default().to_toml_string()?);
    Ok(())
}

/// Validate `path`, or whichever file `load()` would pick
pub fn check(path: Option<&Path>) -> Result<()> {
    let source = match path {
        Some(path) => path.display().to_string(),
        None => match std::env::var(CONFIG_ENV) {
            Ok(env_path) => env_path,
            Err(_) if config_path().exists() => config_path().display().to_string(),
            Err(_) => "built-in defaults".to_string(),
        },
    };

    let config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            println!("{} {}", "[FAIL]".bright_red(), source);
            return Err(e);
        }
    };

    println!("{} {}", "[OK]".bright_green(), source);
    println!();
    print_summary(&config);
    Ok(())
}

fn print_summary(config: &FaultlineConfig) {
    section("AGGREGATION");
    if config.aggregation.enabled {
        println!("  Window:         {} ms", config.aggregation.window_ms);
        println!("  Mode:           {:?}", config.aggregation.mode);
    } else {
        println!("  {}", "disabled".yellow());
    }
    println!();

    section("RATE LIMIT");
    if config.rate_limit.enabled {
        println!(
            "  Threshold:      {} per {} ms ({:?})",
            config.rate_limit.threshold, config.rate_limit.window_ms, config.rate_limit.key_by
        );
        let overflow = if config.rate_limit.use_exponential_backoff {
            format!("suppress, backoff up to 2^{}", config.rate_limit.effective_max_backoff_level())
        } else {
            "batch".to_string()
        };
        println!("  Overflow:       {}", overflow);
    } else {
        println!("  {}", "disabled".yellow());
    }
    println!();

    section("HISTORY");
    println!("  Capacity:       {}", config.history.capacity);
    match &config.history.durable_path {
        Some(path) => println!(
            "  Durable:        {:?} at {}",
            config.history.durable_backend,
            path.display()
        ),
        None => println!("  Durable:        {}", "memory only".yellow()),
    }
    println!(
        "  Retries:        {} (base {} ms, max {} ms)",
        config.history.persistence_retries, config.history.retry_base_ms, config.history.retry_max_ms
    );
    println!();

    section("CLASSIFIER");
    println!("  Fallback:       {}", config.classifier.default_severity);
    for (error_type, severity) in &config.classifier.mappings {
        println!("  {:<24} {}", error_type, severity);
    }
    println!();

    section("TREATMENT");
    for severity in Severity::ALL {
        let t = faultline::treatment::resolve(severity, &config.treatment);
        println!(
            "  {:<8} {:?} blocking={} timeout={}",
            severity,
            t.dialog_kind,
            t.blocking,
            t.timeout_ms
                .map(|ms| format!("{} ms", ms))
                .unwrap_or_else(|| "none".to_string())
        );
    }
    println!();
}
