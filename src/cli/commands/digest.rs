//! Digest command - content digests of workspace paths

use crate::cli::args::{DigestAction, DigestArgs, OutputFormat};
use crate::config::Config;
use crate::error::{CairnError, CairnResult};
use crate::workspace::{DirectoryHandle, FileHandle, WorkspaceRoot};
use console::style;

/// Execute the digest command
pub async fn execute(args: DigestArgs, _config: &Config) -> CairnResult<()> {
    let cwd = std::env::current_dir().map_err(|e| CairnError::io("getting current directory", e))?;
    let root = match args.root {
        Some(root) => cwd.join(root),
        None => cwd,
    };
    let workspace = WorkspaceRoot::new(root)?;

    match args.action {
        DigestAction::Dir {
            path,
            includes,
            excludes,
        } => {
            let handle = workspace.directory(&path, &includes, &excludes).await?;
            print_directory(&handle, args.format)?;
        }
        DigestAction::File { path } => {
            let handle = workspace.file(&path).await?;
            print_file(&handle, args.format)?;
        }
    }

    Ok(())
}

fn print_directory(handle: &DirectoryHandle, format: OutputFormat) -> CairnResult<()> {
    match format {
        OutputFormat::Plain => println!("{}", handle.digest),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(handle)?),
        OutputFormat::Table => {
            println!("{:<10} {}", style("PATH").bold(), handle.path);
            if !handle.includes.is_empty() {
                println!("{:<10} {}", style("INCLUDE").bold(), handle.includes.join(" "));
            }
            if !handle.excludes.is_empty() {
                println!("{:<10} {}", style("EXCLUDE").bold(), handle.excludes.join(" "));
            }
            println!("{:<10} {}", style("FILES").bold(), handle.file_count);
            println!("{:<10} {}", style("BYTES").bold(), handle.total_bytes);
            println!("{:<10} {}", style("DIGEST").bold(), handle.digest);
        }
    }
    Ok(())
}

fn print_file(handle: &FileHandle, format: OutputFormat) -> CairnResult<()> {
    match format {
        OutputFormat::Plain => println!("{}", handle.digest),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(handle)?),
        OutputFormat::Table => {
            println!("{:<10} {}", style("PATH").bold(), handle.path);
            println!("{:<10} {}", style("BYTES").bold(), handle.size);
            println!("{:<10} {}", style("DIGEST").bold(), handle.digest);
        }
    }
    Ok(())
}
