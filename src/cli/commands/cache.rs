//! Cache command - inspect and collect the local cache

use crate::audit::AuditLog;
use crate::cache::{
    format_bytes, CacheEntry, CacheEntrySet, CacheSizeStatus, DirObjectStore, EntryId, GcManager,
    GcReport, ObjectStore, PruneReport,
};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::{CairnError, CairnResult};
use crate::filelock::FileLock;
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Entry index kept next to the object directory
pub const INDEX_FILE: &str = "index.json";

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> CairnResult<()> {
    let exclusive = matches!(
        args.action,
        CacheAction::Add { .. } | CacheAction::Prune | CacheAction::Gc { dry_run: false }
    );
    let cache = LocalCache::open(config, exclusive).await?;
    let audit = AuditLog::new(config);

    match args.action {
        CacheAction::List { format } => {
            let entries = cache.gc.entries().entry_set();
            match format {
                OutputFormat::Table => print_entry_table(&entries),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
                OutputFormat::Plain => {
                    for entry in &entries {
                        println!("{}", entry.id);
                    }
                }
            }
        }
        CacheAction::Usage => show_usage(&cache)?,
        CacheAction::KeepBytes => println!("{}", cache.gc.resolved_keep_bytes()?),
        CacheAction::Add { file, description } => {
            add_entry(&cache, &file, description, config, &audit).await?
        }
        CacheAction::Prune => {
            let report = cache.gc.prune().await;
            audit.pruned(&report).await;
            cache.save().await?;
            cache.remove_orphans().await?;
            print_prune_report(&report);
        }
        CacheAction::Gc { dry_run } => {
            if dry_run {
                print_plan(&cache.gc.plan()?, cache.gc.resolved_keep_bytes()?);
            } else {
                let report = cache.gc.run_once().await?;
                audit.collected(&report).await;
                cache.save().await?;
                cache.remove_orphans().await?;
                print_gc_report(&report);
            }
        }
    }

    Ok(())
}

/// The on-disk cache of this host: object store, entry index, collector.
/// An exclusive handle holds the index lock from load to drop, so
/// commands in other processes see each other's changes.
struct LocalCache {
    index_path: PathBuf,
    store: Arc<DirObjectStore>,
    gc: GcManager,
    _lock: Option<FileLock>,
}

impl LocalCache {
    async fn open(config: &Config, exclusive: bool) -> CairnResult<Self> {
        let dir = ConfigManager::cache_dir(config);
        let store = Arc::new(DirObjectStore::open(&dir).await?);
        let index_path = dir.join(INDEX_FILE);
        let lock = if exclusive {
            Some(FileLock::acquire(&index_path).await?)
        } else {
            None
        };
        let entries = Arc::new(CacheEntrySet::load(&index_path).await?);
        debug!(
            "Opened cache at {} ({} entries)",
            dir.display(),
            entries.len()
        );

        let gc = GcManager::new(entries, store.clone(), &dir, config.gc.policy())?;
        Ok(Self {
            index_path,
            store,
            gc,
            _lock: lock,
        })
    }

    async fn save(&self) -> CairnResult<()> {
        self.gc.entries().save(&self.index_path).await
    }

    /// Delete objects no index entry refers to, left behind by a command
    /// that stored its object but died before saving the index
    async fn remove_orphans(&self) -> CairnResult<usize> {
        let mut removed = 0;
        for id in self.store.object_ids().await? {
            if self.gc.entries().get(&id).is_none() {
                self.store.remove(&id).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} unindexed cache objects", removed);
        }
        Ok(removed)
    }
}

async fn add_entry(
    cache: &LocalCache,
    file: &Path,
    description: Option<String>,
    config: &Config,
    audit: &AuditLog,
) -> CairnResult<()> {
    if !file.is_file() {
        return Err(CairnError::NotAFile(file.to_path_buf()));
    }
    let description = description.unwrap_or_else(|| {
        file.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.display().to_string())
    });

    let id = EntryId::generate();
    let bytes = cache.store.put_file(&id, file).await?;
    let entry = match cache.gc.entries().insert(id.clone(), description, bytes) {
        Ok(entry) => entry,
        Err(e) => {
            cache.store.remove(&id).await?;
            return Err(e);
        }
    };
    cache.save().await?;

    println!(
        "{} {} ({})",
        style("Added").green(),
        entry.id,
        format_bytes(entry.disk_space_bytes)
    );

    if config.gc.enabled {
        let report = cache.gc.run_once().await?;
        if !report.eviction.evicted.is_empty() {
            audit.collected(&report).await;
            cache.save().await?;
            print_gc_report(&report);
        }
    }
    Ok(())
}

fn show_usage(cache: &LocalCache) -> CairnResult<()> {
    let used = cache.gc.entries().disk_space_bytes();
    let keep = cache.gc.resolved_keep_bytes()?;
    let status = CacheSizeStatus::from_usage(used, keep);
    let status_display = match status {
        CacheSizeStatus::Ok => style("ok").green(),
        CacheSizeStatus::Warning => style("near budget").yellow(),
        CacheSizeStatus::Exceeded => style("over budget").red(),
    };

    println!("Storage:  {}", cache.gc.storage_root().display());
    println!("Entries:  {}", cache.gc.entries().len());
    println!(
        "Usage:    {} of {} ({:.1}%)",
        format_bytes(used),
        format_bytes(keep),
        CacheSizeStatus::percentage(used, keep)
    );
    println!("Budget:   {} ({})", cache.gc.policy().keep_bytes, status_display);
    Ok(())
}

fn print_entry_table(entries: &[CacheEntry]) {
    if entries.is_empty() {
        println!("No cache entries.");
        return;
    }

    println!(
        "{:<14} {:<32} {:<10} {:<18} {}",
        style("ID").bold(),
        style("DESCRIPTION").bold(),
        style("SIZE").bold(),
        style("LAST USED").bold(),
        style("ACTIVE").bold()
    );
    println!("{}", "-".repeat(84));

    for entry in entries {
        let active = if entry.actively_used {
            style("yes").green().to_string()
        } else {
            style("no").dim().to_string()
        };
        println!(
            "{:<14} {:<32} {:<10} {:<18} {}",
            entry.id.short(),
            entry.description,
            format_bytes(entry.disk_space_bytes),
            entry.last_used_at.format("%Y-%m-%d %H:%M"),
            active
        );
    }

    let total: u64 = entries.iter().map(|e| e.disk_space_bytes).sum();
    println!();
    println!("Total: {} entries, {}", entries.len(), format_bytes(total));
}

fn print_prune_report(report: &PruneReport) {
    for entry in &report.evicted {
        println!(
            "  {} {} {}",
            style("Evicted").red(),
            entry.id.short(),
            entry.description
        );
    }
    for skipped in &report.skipped {
        println!(
            "  {} {} {} ({})",
            style("Kept").dim(),
            skipped.id.short(),
            skipped.description,
            skipped.reason
        );
    }
    println!(
        "Freed {} from {} entries",
        format_bytes(report.freed_bytes),
        report.evicted_count()
    );
}

fn print_gc_report(report: &GcReport) {
    if report.usage_before <= report.keep_bytes {
        println!(
            "Usage {} is within budget {}; nothing to collect",
            format_bytes(report.usage_before),
            format_bytes(report.keep_bytes)
        );
        return;
    }
    print_prune_report(&report.eviction);
    println!(
        "Usage {} -> {} (budget {})",
        format_bytes(report.usage_before),
        format_bytes(report.usage_after),
        format_bytes(report.keep_bytes)
    );
}

fn print_plan(planned: &[CacheEntry], keep: u64) {
    if planned.is_empty() {
        println!("Nothing to collect (budget {})", format_bytes(keep));
        return;
    }

    println!("Would evict {} entries:", planned.len());
    for entry in planned {
        println!(
            "  {} {} ({})",
            entry.id.short(),
            entry.description,
            format_bytes(entry.disk_space_bytes)
        );
    }
    let total: u64 = planned.iter().map(|e| e.disk_space_bytes).sum();
    println!("Total: {}", format_bytes(total));
}
