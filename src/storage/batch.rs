use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use crate::utils::time::dt_stamp;
use crate::worker::activity::ActivityItem;

/// Persist one crawl cycle's ordered items as a batch file
///
/// The file is named by creation timestamp and never mutated afterwards;
/// the returned path becomes the queued task reference.
pub async fn save_batch(
    dir: &Path,
    created_at: NaiveDateTime,
    items: &[ActivityItem],
) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .await
        .context(format!("Failed to create batch directory {}", dir.display()))?;

    let path = dir.join(format!("{}.json", dt_stamp(created_at)));
    let contents =
        serde_json::to_string_pretty(items).context("Failed to serialize batch items")?;

    fs::write(&path, contents)
        .await
        .context(format!("Failed to write batch file {}", path.display()))?;

    info!("Saved {} items to {}", items.len(), path.display());
    Ok(path)
}

/// Read a batch back for archiving
pub async fn load_batch(path: &Path) -> Result<Vec<ActivityItem>> {
    let contents = fs::read_to_string(path)
        .await
        .context(format!("Failed to read batch file {}", path.display()))?;

    serde_json::from_str(&contents)
        .context(format!("Failed to parse batch file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::time;
    use crate::worker::activity::{ActivityMeta, Target};

    fn item(title: &str) -> ActivityItem {
        ActivityItem::new(
            ActivityMeta {
                action: "赞同".to_string(),
                target_type: "回答".to_string(),
                acted_at: time::now(),
                raw: Some(vec!["赞同了回答".to_string(), "2024-01-02 03:04".to_string()]),
            },
            Target {
                title: title.to_string(),
                link: "//www.zhihu.com/question/1/answer/2".to_string(),
                author: "someone".to_string(),
                fetched_at: time::now(),
            },
        )
    }

    #[tokio::test]
    async fn batch_round_trip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let items = vec![item("first"), item("second"), item("third")];

        let path = save_batch(dir.path(), time::now(), &items).await.unwrap();
        let loaded = load_batch(&path).await.unwrap();

        let titles: Vec<&str> = loaded.iter().map(|i| i.target.title.as_str()).collect();
        assert_eq!(titles, vec!["first", "second", "third"]);
        assert_eq!(loaded[0].id, items[0].id);
    }

    #[tokio::test]
    async fn batch_filename_is_the_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let created = time::from_iso("2024-01-02T03:04:05").unwrap();
        let path = save_batch(dir.path(), created, &[]).await.unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "20240102030405.json"
        );
    }
}
