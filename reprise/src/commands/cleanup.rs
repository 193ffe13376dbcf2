//! Cleanup command: destroy clones of dead runs

use super::CommandResult;
use convenient_ports::pool::cleanup_leftovers;
use convenient_ports::{Config, StorageLayout};
use convenient_zfs::{SnapshotStore, ZfsStore};
use std::path::Path;

pub async fn execute(config_path: Option<&Path>, dry_run: bool) -> CommandResult<()> {
    let mut config = Config::discover(config_path)?;
    let store = ZfsStore::new();
    config.storage.select_pool(&store.pools().await?)?;
    let layout = StorageLayout::new(config.storage.dataset());

    if dry_run {
        let leftovers = store.children(&layout.instances()).await?;
        println!("🧹 {} leftover run(s):", leftovers.len());
        for dataset in leftovers {
            println!("  {dataset}");
        }
        return Ok(());
    }

    let destroyed = cleanup_leftovers(&store, &layout, None).await?;
    println!("🧹 Destroyed {} leftover run(s)", destroyed.len());
    for dataset in destroyed {
        println!("  ✓ {dataset}");
    }
    Ok(())
}
