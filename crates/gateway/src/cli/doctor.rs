use conduit_domain::{Config, ConfigSeverity};

/// Run all diagnostic checks and print a summary.
///
/// Returns `Ok(true)` when every check passes, `Ok(false)` when at least
/// one check failed.
pub async fn run(config: &Config, config_path: &str) -> anyhow::Result<bool> {
    println!("conduit doctor");
    println!("==============\n");

    let mut all_passed = true;

    check_config_file(config_path, &mut all_passed);
    check_config_validation(config, &mut all_passed);
    check_state_secret(config);
    check_bind(config, &mut all_passed).await;

    println!();
    if all_passed {
        println!("All checks passed.");
    } else {
        println!("Some checks failed. Review the output above.");
    }

    Ok(all_passed)
}

// ── Individual checks ─────────────────────────────────────────────────

fn check_config_file(config_path: &str, all_passed: &mut bool) {
    let exists = std::path::Path::new(config_path).exists();
    print_check(
        "Config file exists",
        exists,
        if exists {
            config_path.to_owned()
        } else {
            format!("{config_path} not found (using defaults)")
        },
    );
    if !exists {
        *all_passed = false;
    }
}

fn check_config_validation(config: &Config, all_passed: &mut bool) {
    let issues = config.validate();
    let error_count = issues.iter().filter(|e| e.severity == ConfigSeverity::Error).count();

    if issues.is_empty() {
        print_check("Config validation", true, "no issues".into());
    } else {
        print_check(
            "Config validation",
            error_count == 0,
            format!("{} issue(s) ({} error(s))", issues.len(), error_count),
        );
        for issue in &issues {
            println!(" {issue}");
        }
        if error_count > 0 {
            *all_passed = false;
        }
    }
}

/// Missing signing secret only degrades gracefully (an ephemeral key is
/// generated and `config.validate()` already surfaces it as a warning),
/// so this check is informational and never fails the run.
fn check_state_secret(config: &Config) {
    let present = std::env::var(&config.state.secret_env).is_ok();
    print_check(
        "State signing secret",
        present,
        if present {
            format!("{} is set", config.state.secret_env)
        } else {
            format!(
                "{} is unset; state export/restore will use an ephemeral key",
                config.state.secret_env
            )
        },
    );
}

async fn check_bind(config: &Config, all_passed: &mut bool) {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => {
            drop(listener);
            print_check("Bind test", true, addr);
        }
        Err(e) => {
            print_check("Bind test", false, format!("{addr}: {e}"));
            *all_passed = false;
        }
    }
}

// ── Formatting helper ─────────────────────────────────────────────────

fn print_check(name: &str, passed: bool, detail: String) {
    let status = if passed { "PASS" } else { "FAIL" };
    println!(" [{status}] {name}: {detail}");
}
