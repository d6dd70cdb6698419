//! Item retrieval by id.
//!
//! Fetches one canonical item from the local store. Used by `catsync get`.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::models::{CanonicalItem, ContentKind};
use crate::store::{CatalogStore, SqliteStore};

/// Load one item, failing if the id is unknown.
pub async fn get_item(store: &dyn CatalogStore, id: i64) -> Result<CanonicalItem> {
    match store.get_item(id).await? {
        Some(item) => Ok(item),
        None => bail!("item not found: {}", id),
    }
}

/// CLI entry point: print the item as text or JSON.
pub async fn run_get(config: &Config, id: i64, json: bool) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let item = get_item(&store, id).await;
    store.pool().close().await;
    let item = item?;

    if json {
        println!("{}", serde_json::to_string_pretty(&item)?);
        return Ok(());
    }

    println!("--- Item ---");
    println!("id:           {}", item.id);
    println!("title:        {}", item.title);
    println!("source:       {}", item.source);
    println!("kind:         {}", describe_kind(&item.kind));
    println!("slug:         {}", item.slug);
    println!("page:         {}", item.source_page_url);
    if let Some(year) = item.year {
        println!("year:         {}", year);
    }
    if let Some(rating) = item.rating {
        println!("rating:       {:.1}", rating);
    }
    if !item.genres.is_empty() {
        println!("genres:       {}", item.genres.join(", "));
    }
    if let Some(ref url) = item.poster_url {
        println!("poster:       {}", url);
    }
    if let Some(ref url) = item.backdrop_url {
        println!("backdrop:     {}", url);
    }
    if let Some(ref url) = item.video_url {
        println!("video:        {}", url);
    }
    if let Some(at) = item.published_at {
        println!("published:    {}", at.format("%Y-%m-%dT%H:%M:%SZ"));
    }
    if let Some(at) = item.modified_at {
        println!("modified:     {}", at.format("%Y-%m-%dT%H:%M:%SZ"));
    }
    if let Some(ref description) = item.description {
        println!();
        println!("--- Description ---");
        println!("{}", description);
    }

    Ok(())
}

fn describe_kind(kind: &ContentKind) -> String {
    match kind {
        ContentKind::Episode {
            series_slug,
            season,
            episode,
        } => match series_slug {
            Some(series) => format!("episode S{:02}E{:02} of {}", season, episode, series),
            None => format!("episode S{:02}E{:02}", season, episode),
        },
        other => other.label().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentSource;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn unknown_id_is_an_error() {
        let store = InMemoryStore::new();
        let err = get_item(&store, 42).await.unwrap_err();
        assert!(err.to_string().contains("item not found: 42"));
    }

    #[tokio::test]
    async fn stored_item_is_returned() {
        let store = InMemoryStore::new();
        let item = CanonicalItem::new(
            ContentSource::ScrapedCatalog,
            ContentKind::Movie,
            "the-last-night",
            "The Last Night",
            "https://namakade.com/movies/the-last-night",
        );
        store.upsert_item(&item).await.unwrap();
        assert_eq!(get_item(&store, item.id).await.unwrap(), item);
    }

    #[test]
    fn episode_kind_is_described() {
        let kind = ContentKind::Episode {
            series_slug: Some("gridmason".to_string()),
            season: 2,
            episode: 3,
        };
        assert_eq!(describe_kind(&kind), "episode S02E03 of gridmason");
    }
}
