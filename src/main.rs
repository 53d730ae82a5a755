use std::io::Read;

use agent_router::monitor::refresh_usage_once;
use agent_router::profile::ProfileKind;
use agent_router::service::FailoverService;
use agent_router::usage::HttpUsageChecker;
use agent_router::{classify, SwapSignal};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Unable to create Runtime");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("list");

    let service = rt.block_on(FailoverService::init())?;

    match command {
        "list" => {
            let profiles = service.list_profiles();
            if profiles.is_empty() {
                println!("No profiles found. Use 'add' to create one.");
                return Ok(());
            }
            println!("Profiles:");
            for profile in profiles {
                let marker = if profile.is_active { "*" } else { " " };
                let mut line = format!("  {} {} [{}] ({})", marker, profile.name, profile.kind.as_str(), profile.id);
                if let Some(email) = profile.email {
                    line.push_str(&format!(" - {}", email));
                }
                if let Some(plan) = profile.plan {
                    line.push_str(&format!(" - {} plan", plan));
                }
                if let Some(until) = profile.limited_until {
                    line.push_str(&format!(" - limited until {}", until));
                }
                println!("{}", line);
            }
            let migrated = service.migrated_profile_ids();
            if !migrated.is_empty() {
                println!("Profiles needing re-authentication: {}", migrated.join(", "));
            }
        }
        "add" => {
            let name = args.get(1).ok_or_else(|| anyhow::anyhow!("Usage: add <name> [--api-key]"))?;
            let kind = if args.iter().any(|arg| arg == "--api-key") {
                ProfileKind::ApiKey
            } else {
                ProfileKind::Oauth
            };
            let profile = service.add_profile(name, kind)?;
            println!("Added profile: {} ({})", profile.name, profile.id);
            println!("Credential directory: {}", profile.config_dir.display());
        }
        "remove" => {
            let id = args.get(1).ok_or_else(|| anyhow::anyhow!("Usage: remove <id>"))?;
            service.remove_profile(id)?;
            println!("Removed profile: {}", id);
        }
        "use" => {
            let id = args.get(1).ok_or_else(|| anyhow::anyhow!("Usage: use <id>"))?;
            service.set_active_profile(Some(id))?;
            println!("Switched to profile: {}", id);
        }
        "env" => {
            let outcome = service.best_available_profile_env()?;
            for (key, value) in &outcome.env {
                println!("{}={}", key, value);
            }
            service.mark_last_used(&outcome.selected_profile)?;
            if outcome.all_limited {
                match outcome.retry_at {
                    Some(at) => eprintln!("All profiles are currently limited, retry after {}", at),
                    None => eprintln!("All profiles are currently limited, retry later"),
                }
            } else if outcome.was_swapped {
                let reason = outcome
                    .swap_reason
                    .map(|reason| reason.as_str())
                    .unwrap_or("unknown");
                eprintln!("Selected profile {} ({})", outcome.selected_profile, reason);
            }
        }
        "record" => {
            // Classify captured subprocess output piped on stdin and record
            // any rate limit against the given profile.
            let id = args.get(1).ok_or_else(|| anyhow::anyhow!("Usage: record <id> < output.txt"))?;
            let mut output = String::new();
            std::io::stdin().read_to_string(&mut output)?;
            let detection = classify(&output);
            if detection.is_rate_limited {
                service.record_rate_limit(id, &detection)?;
                println!("Recorded rate limit for {} (resets at {:?})", id, detection.resets_at);
            } else {
                println!("No rate limit detected");
            }
        }
        "check" => {
            let checker = HttpUsageChecker::new()?;
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            rt.block_on(refresh_usage_once(&service, &checker, &tx));

            for profile in service.list_profiles() {
                match profile.usage {
                    Some(usage) => println!(
                        "  {}: session {}%, weekly {}%",
                        profile.name,
                        usage.session_percent.map_or("?".to_string(), |p| format!("{:.0}", p)),
                        usage.weekly_percent.map_or("?".to_string(), |p| format!("{:.0}", p)),
                    ),
                    None => println!("  {}: no usage data", profile.name),
                }
            }
            while let Ok(SwapSignal::Capacity { profile_id, window, percent }) = rx.try_recv() {
                eprintln!(
                    "Profile {} is at {:.0}% of its {:?} window; consider switching",
                    profile_id, percent, window
                );
            }
        }
        "settings" => {
            let settings = service.auto_switch_settings();
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        other => {
            anyhow::bail!(
                "Unknown command '{}'. Commands: list, add, remove, use, env, record, check, settings",
                other
            );
        }
    }

    Ok(())
}
