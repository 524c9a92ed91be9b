//! Lock command - query and update the resolver lockfile

use crate::audit::AuditLog;
use crate::cli::args::{LockAction, LockArgs, OutputFormat};
use crate::config::Config;
use crate::error::{CairnError, CairnResult};
use crate::lockfile::{
    Lockfile, LockfileEntry, Primitive, RecordOutcome, ResolverCall, StaticResolver,
};
use console::style;

/// Execute the lock command
pub async fn execute(args: LockArgs, config: &Config) -> CairnResult<()> {
    let path = match args.lockfile {
        Some(path) => path,
        None => std::env::current_dir()
            .map_err(|e| CairnError::io("getting current directory", e))?
            .join(&config.lockfile.name),
    };
    let lockfile = Lockfile::open(path, config.lockfile.conflict).await?;

    match args.action {
        LockAction::Resolve {
            module,
            function,
            inputs,
            fallback,
        } => {
            let call = parse_call(module, function, &inputs);
            // no network here: a miss is answered by --fallback or fails
            let resolver = match &fallback {
                Some(output) => StaticResolver::new().with(call.clone(), output.clone()),
                None => StaticResolver::new(),
            };
            let resolution = lockfile.resolve_with(&call, &resolver).await?;
            if !resolution.locked {
                AuditLog::new(config)
                    .lock_recorded(&call, &resolution.output, &RecordOutcome::Inserted)
                    .await;
            }
            println!("{}", resolution.output);
        }
        LockAction::Record {
            module,
            function,
            inputs,
            output,
            relock,
        } => {
            let call = parse_call(module, function, &inputs);
            let outcome = if relock {
                lockfile.relock(call.clone(), output.clone()).await?
            } else {
                lockfile.record(call.clone(), output.clone()).await?
            };
            AuditLog::new(config)
                .lock_recorded(&call, &output, &outcome)
                .await;
            print_outcome(&call, &outcome);
        }
        LockAction::Remove {
            module,
            function,
            inputs,
        } => {
            let call = parse_call(module, function, &inputs);
            if lockfile.remove(&call).await? {
                AuditLog::new(config)
                    .log("lock.remove", &serde_json::json!({ "call": call.to_string() }))
                    .await;
                println!("{} {}", style("Removed").green(), call);
            } else {
                println!("{} {}", style("Not locked").dim(), call);
            }
        }
        LockAction::List { format } => {
            let entries = lockfile.entries();
            match format {
                OutputFormat::Table => print_table(&entries),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
                OutputFormat::Plain => {
                    for entry in &entries {
                        println!("{}", entry.encode_line());
                    }
                }
            }
        }
        LockAction::Verify => {
            if !lockfile.verify().await? {
                return Err(CairnError::User(format!(
                    "{} is valid but not in canonical form; record any entry to rewrite it",
                    lockfile.path().display()
                )));
            }
            println!(
                "{} {} ({} entries)",
                style("OK").green(),
                lockfile.path().display(),
                lockfile.len()
            );
        }
    }

    Ok(())
}

/// Build a call from CLI inputs. Each input is read as a JSON literal
/// (`42`, `true`, `null`, `"quoted"`) and otherwise taken verbatim as a
/// string.
pub(crate) fn parse_call(module: String, function: String, inputs: &[String]) -> ResolverCall {
    ResolverCall::new(module, function, inputs.iter().map(|raw| parse_input(raw)))
}

fn parse_input(raw: &str) -> Primitive {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|value| Primitive::from_json(&value).ok())
        .unwrap_or_else(|| Primitive::from(raw))
}

fn print_outcome(call: &ResolverCall, outcome: &RecordOutcome) {
    match outcome {
        RecordOutcome::Inserted => println!("{} {}", style("Locked").green(), call),
        RecordOutcome::Unchanged => println!("{} {}", style("Unchanged").dim(), call),
        RecordOutcome::Replaced { previous } => println!(
            "{} {} (was {})",
            style("Relocked").yellow(),
            call,
            previous
        ),
    }
}

fn print_table(entries: &[LockfileEntry]) {
    if entries.is_empty() {
        println!("No locked entries.");
        return;
    }

    println!(
        "{:<8} {:<16} {:<50} {}",
        style("MODULE").bold(),
        style("FUNCTION").bold(),
        style("INPUTS").bold(),
        style("OUTPUT").bold()
    );
    println!("{}", "-".repeat(100));

    for entry in entries {
        let inputs: Vec<String> = entry.inputs.iter().map(|i| i.to_string()).collect();
        println!(
            "{:<8} {:<16} {:<50} {}",
            entry.module,
            entry.function,
            truncate(&inputs.join(", "), 50),
            entry.output
        );
    }

    println!();
    println!("Total: {} entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}
