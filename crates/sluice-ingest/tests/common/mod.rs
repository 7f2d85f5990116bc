//! Shared fixtures: a mocked source API and warehouse helpers
#![allow(dead_code)]

use serde_json::{json, Value};
use sluice_ingest::config::IngestConfig;
use std::path::Path;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TOKEN: &str = "test-token";
pub const PRIMARY_TABLE: &str = "bronze_sp_all_items";
pub const ENTITY_TABLE: &str = "bronze_sp_artist_genre";

/// Saved track `n`, credited to artist `A1` when even and `A2` when odd
pub fn track(n: u64) -> Value {
    let (id, name) = if n % 2 == 0 { ("A1", "First Artist") } else { ("A2", "Second Artist") };
    json!({
        "added_at": "2024-01-01T00:00:00Z",
        "track": {
            "id": format!("t{n}"),
            "name": format!("Track {n}"),
            "album": {"artists": [{"id": id, "name": name}]}
        }
    })
}

/// Mount the collection endpoint: a `limit=1` probe plus one mock per page
pub async fn mount_collection(server: &MockServer, total: u64, page_size: u64) {
    Mock::given(method("GET"))
        .and(path("/v1/me/tracks"))
        .and(query_param("limit", "1"))
        .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "total": total,
            "items": [track(0)]
        })))
        .mount(server)
        .await;

    let mut offset = 0;
    while offset < total {
        let items: Vec<Value> = (offset..(offset + page_size).min(total)).map(track).collect();
        Mock::given(method("GET"))
            .and(path("/v1/me/tracks"))
            .and(query_param("offset", offset.to_string().as_str()))
            .and(query_param("limit", page_size.to_string().as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": total,
                "items": items
            })))
            .mount(server)
            .await;
        offset += page_size;
    }
}

/// Mount one artist detail endpoint expected to be hit `times` times
pub async fn mount_artist(server: &MockServer, id: &str, genres: &[&str], times: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/v1/artists/{id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": id,
            "name": format!("Artist {id}"),
            "genres": genres
        })))
        .expect(times)
        .mount(server)
        .await;
}

pub fn config_for(server: &MockServer, work_dir: &Path) -> IngestConfig {
    let mut config = IngestConfig::default();
    config.source.base_url = server.uri();
    config.source.api_token = Some(TOKEN.to_string());
    config.collector.page_size = 20;
    config.collector.concurrency = 4;
    config.enricher.concurrency = 4;
    config.loader.work_dir = work_dir.to_path_buf();
    config
}
