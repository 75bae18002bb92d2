//! `pincer doctor`: check configuration and probe every upstream.

use pincer_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!("pincer doctor");
    println!("=============\n");

    let mut issues = 0;

    let config_path = AppConfig::config_dir().join("config.toml");
    if !config_path.exists() {
        println!("  [warn] No config file at {}; using defaults", config_path.display());
        println!("         Run `pincer onboard` to create one.");
        issues += 1;
    }

    let config = match AppConfig::load() {
        Ok(config) => {
            println!("  [ok]   Configuration valid");
            config
        }
        Err(e) => {
            println!("  [fail] Configuration invalid: {e}");
            println!("\n  1 issue found.");
            return Ok(());
        }
    };

    if config.api_key.is_none() && config.providers.iter().all(|p| p.api_key.is_none()) {
        println!("  [warn] No API key configured (fine for local upstreams only)");
        issues += 1;
    }

    let chain = pincer_providers::build_from_config(&config);
    println!("  [info] Failover order: {}", chain.members().join(" -> "));

    for (name, healthy) in chain.probe().await {
        if healthy {
            println!("  [ok]   Upstream '{name}' reachable");
        } else {
            println!("  [fail] Upstream '{name}' unreachable");
            issues += 1;
        }
    }

    println!();
    if issues == 0 {
        println!("  All checks passed.");
    } else {
        println!("  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}
