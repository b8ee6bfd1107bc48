use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::info;

use strategy_keeper::config::Config;
use strategy_keeper::init::{init_backend, setup_logging};
use strategy_keeper::policy::{LogEvents, StrategyId, StrategyPolicy, TrafficProfile};

const USAGE: &str = "usage: strategy-keeper [--config PATH] <command>

commands:
  show [profile]                    list locks and blocks
  lock <host> <id> [profile] [--user]
  unlock <host> [profile]
  block <host> <id> [profile] [--user]
  unblock <host> <id> [profile]
  record <host> <id> ok|fail        add one history outcome
  best <host> [exclude-id]          best strategy from history
  learned                           dump everything as JSON
  clear-locked
  clear-blocked";

#[tokio::main]
async fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    // 1. Load Config
    let config_path = take_option(&mut args, "--config").unwrap_or("config.toml".to_string());
    let config_exists = std::path::Path::new(&config_path).exists();
    let config = if config_exists {
        Config::load(&config_path).await?
    } else {
        Config::default()
    };

    // 2. Setup Logging
    setup_logging(&config);
    if !config_exists {
        info!("Config file not found, using defaults.");
    }

    // 3. Open backend and load both stores
    let backend = init_backend(&config)?;
    let policy = StrategyPolicy::new(backend, Arc::new(LogEvents));
    policy.load();

    // 4. Run the command
    let user = take_flag(&mut args, "--user");
    let Some((command, rest)) = args.split_first() else {
        println!("{}", USAGE);
        return Ok(());
    };
    run(&policy, command, rest, user)
}

fn run(policy: &StrategyPolicy, command: &str, rest: &[String], user: bool) -> Result<()> {
    match (command, rest) {
        ("show", rest) => {
            let only = rest.first().map(|p| parse_profile(p)).transpose()?;
            for profile in TrafficProfile::ALL {
                if only.is_some_and(|p| p != profile) {
                    continue;
                }
                show_profile(policy, profile);
            }
        }
        ("lock", [host, id, rest @ ..]) => {
            let profile = profile_arg(rest.first())?;
            let id = parse_id(id)?;
            if policy.blocked().is_blocked(host, id, profile) {
                bail!("strategy #{} is blocked for {} [{}]", id, host, profile);
            }
            policy.locked().lock(host, id, profile, user);
        }
        ("unlock", [host, rest @ ..]) => {
            let profile = profile_arg(rest.first())?;
            if !policy.locked().unlock(host, profile) {
                println!("{} has no lock in [{}]", host, profile);
            }
        }
        ("block", [host, id, rest @ ..]) => {
            let profile = profile_arg(rest.first())?;
            policy.blocked().block(host, parse_id(id)?, profile, user);
        }
        ("unblock", [host, id, rest @ ..]) => {
            let profile = profile_arg(rest.first())?;
            let id = parse_id(id)?;
            if !policy.blocked().unblock(host, id, profile) {
                bail!("strategy #{} for {} [{}] cannot be unblocked", id, host, profile);
            }
        }
        ("record", [host, id, outcome]) => {
            let success = match outcome.as_str() {
                "ok" => true,
                "fail" => false,
                other => bail!("outcome must be ok or fail, got {}", other),
            };
            policy
                .locked()
                .increment_history(host, parse_id(id)?, success);
        }
        ("best", [host, rest @ ..]) => {
            let exclude = rest.first().map(|id| parse_id(id)).transpose()?;
            match policy.locked().best_strategy_from_history(host, exclude) {
                Some(id) => println!("{}", id),
                None => println!("no usable history for {}", host),
            }
        }
        ("learned", []) => {
            let data = policy.learned_data();
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        ("clear-locked", []) => {
            if !policy.locked().clear() {
                bail!("failed to clear locked strategies");
            }
        }
        ("clear-blocked", []) => {
            let removed = policy.blocked().clear();
            println!("removed {} blocked entries", removed);
        }
        _ => bail!("{}", USAGE),
    }
    Ok(())
}

fn show_profile(policy: &StrategyPolicy, profile: TrafficProfile) {
    let locked = policy.locked().get_all(profile);
    let blocked = policy.blocked().get_user_blocked(profile);
    if locked.is_empty() && blocked.is_empty() {
        return;
    }

    println!("[{}]", profile);
    for (host, id) in &locked {
        let marker = if policy.locked().is_user_locked(host, profile) {
            " (user)"
        } else {
            ""
        };
        println!("  lock   {} -> #{}{}", host, id, marker);
    }
    for (host, ids) in &blocked {
        println!("  block  {} -> {:?}", host, ids);
    }
}

fn profile_arg(arg: Option<&String>) -> Result<TrafficProfile> {
    arg.map_or(Ok(TrafficProfile::Tls), |p| parse_profile(p))
}

fn parse_profile(name: &str) -> Result<TrafficProfile> {
    TrafficProfile::parse_known(name).with_context(|| format!("unknown profile: {}", name))
}

fn parse_id(raw: &str) -> Result<StrategyId> {
    let id: StrategyId = raw
        .parse()
        .with_context(|| format!("invalid strategy id: {}", raw))?;
    if id == 0 {
        bail!("strategy ids start at 1");
    }
    Ok(id)
}

fn take_option(args: &mut Vec<String>, name: &str) -> Option<String> {
    let idx = args.iter().position(|a| a == name)?;
    args.remove(idx);
    (idx < args.len()).then(|| args.remove(idx))
}

fn take_flag(args: &mut Vec<String>, name: &str) -> bool {
    let before = args.len();
    args.retain(|a| a != name);
    args.len() != before
}
