//! End-to-end protocol tests over real HTTP.

#[path = "common.rs"]
mod common;

use std::sync::Arc;

use common::TestHost;
use serde_json::{Value, json};
use syncstore::server::StaticAuthenticator;

async fn body_json(response: reqwest::Response) -> Value {
    response.json().await.expect("Failed to parse JSON body")
}

fn header<'r>(response: &'r reqwest::Response, name: &str) -> Option<&'r str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

#[tokio::test]
async fn test_put_get_round_trip() {
    let host = TestHost::start().await;

    let put = host
        .put("/1.5/42/storage/bookmarks/aaa", r#"{"payload":"X"}"#)
        .await;
    assert_eq!(put.status(), 200);
    assert!(header(&put, "X-Last-Modified").is_some());
    let t1 = body_json(put).await.as_f64().expect("timestamp body");

    let get = host.get("/1.5/42/storage/bookmarks/aaa").await;
    assert_eq!(get.status(), 200);
    let bso = body_json(get).await;
    assert_eq!(bso["id"], "aaa");
    assert_eq!(bso["payload"], "X");
    assert_eq!(bso["modified"].as_f64().unwrap(), t1);

    let info = host.get("/1.5/42/info/collections").await;
    assert_eq!(info.status(), 200);
    let info = body_json(info).await;
    assert_eq!(info["bookmarks"].as_f64().unwrap(), t1);
}

#[tokio::test]
async fn test_put_round_trips_sortindex_and_ttl() {
    let host = TestHost::start().await;
    host.put(
        "/1.5/42/storage/bookmarks/aaa",
        r#"{"payload":"X","sortindex":12,"ttl":3600}"#,
    )
    .await;
    let bso = body_json(host.get("/1.5/42/storage/bookmarks/aaa").await).await;
    assert_eq!(bso["sortindex"], 12);
    assert_eq!(bso["ttl"], 3600);
}

#[tokio::test]
async fn test_post_partial_success() {
    let host = TestHost::start().await;
    let post = host
        .post(
            "/1.5/42/storage/bookmarks",
            r#"[{"id":"a","payload":"1"},{"id":"","payload":"2"},{"id":"b","payload":"3"}]"#,
        )
        .await;
    assert_eq!(post.status(), 200);
    assert!(header(&post, "X-Last-Modified").is_some());
    let result = body_json(post).await;
    assert_eq!(result["success"], json!(["a", "b"]));
    assert_eq!(result["failed"][""], json!(["invalid id"]));

    let counts = body_json(host.get("/1.5/42/info/collection_counts").await).await;
    assert_eq!(counts["bookmarks"], 2);
}

#[tokio::test]
async fn test_post_empty_batch_is_a_noop() {
    let host = TestHost::start().await;
    host.put("/1.5/42/storage/bookmarks/aaa", r#"{"payload":"X"}"#)
        .await;
    let before = body_json(host.get("/1.5/42/info/collections").await).await;

    let post = host.post("/1.5/42/storage/bookmarks", "[]").await;
    assert_eq!(post.status(), 200);
    let result = body_json(post).await;
    assert_eq!(result["success"], json!([]));
    assert_eq!(result["failed"], json!({}));

    let after = body_json(host.get("/1.5/42/info/collections").await).await;
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_post_too_many_records_is_request_level_413() {
    let host = TestHost::start().await;
    let records: Vec<Value> = (0..101)
        .map(|i| json!({"id": format!("id{i}"), "payload": "x"}))
        .collect();
    let post = host
        .post("/1.5/42/storage/bookmarks", &json!(records).to_string())
        .await;
    assert_eq!(post.status(), 413);
    // No side effects.
    let counts = body_json(host.get("/1.5/42/info/collection_counts").await).await;
    assert!(counts.as_object().unwrap().is_empty());
}

#[tokio::test]
async fn test_payload_size_boundary() {
    let host = TestHost::builder()
        .with_settings(|settings| {
            settings.limits.max_record_payload_bytes = 16;
            settings.limits.max_post_bytes = 1024;
        })
        .start()
        .await;
    let exact = "x".repeat(16);
    let put = host
        .put(
            "/1.5/42/storage/bookmarks/fit",
            &json!({"payload": exact}).to_string(),
        )
        .await;
    assert_eq!(put.status(), 200);

    let over = "x".repeat(17);
    let put = host
        .put(
            "/1.5/42/storage/bookmarks/big",
            &json!({"payload": over}).to_string(),
        )
        .await;
    assert_eq!(put.status(), 413);

    // In a batch the oversize record is a per-record failure.
    let post = host
        .post(
            "/1.5/42/storage/bookmarks",
            &json!([{"id": "big", "payload": "x".repeat(17)}]).to_string(),
        )
        .await;
    assert_eq!(post.status(), 200);
    let result = body_json(post).await;
    assert_eq!(result["failed"]["big"], json!(["payload too large"]));
}

#[tokio::test]
async fn test_precondition_unmodified_since() {
    let host = TestHost::start().await;
    let put = host
        .put("/1.5/42/storage/bookmarks/a", r#"{"payload":"first"}"#)
        .await;
    let t1 = header(&put, "X-Last-Modified").unwrap().to_string();

    // A stale stamp loses.
    let stale = host
        .put_with_headers(
            "/1.5/42/storage/bookmarks/a",
            r#"{"payload":"second"}"#,
            &[("X-If-Unmodified-Since", "0.01")],
        )
        .await;
    assert_eq!(stale.status(), 412);
    let bso = body_json(host.get("/1.5/42/storage/bookmarks/a").await).await;
    assert_eq!(bso["payload"], "first");

    // The stamp the client saw wins.
    let fresh = host
        .put_with_headers(
            "/1.5/42/storage/bookmarks/a",
            r#"{"payload":"second"}"#,
            &[("X-If-Unmodified-Since", &t1)],
        )
        .await;
    assert_eq!(fresh.status(), 200);
}

#[tokio::test]
async fn test_not_modified_since() {
    let host = TestHost::start().await;
    let put = host
        .put("/1.5/42/storage/bookmarks/a", r#"{"payload":"x"}"#)
        .await;
    let t1 = header(&put, "X-Last-Modified").unwrap().to_string();

    let get = host
        .get_with_headers(
            "/1.5/42/storage/bookmarks/a",
            &[("X-If-Modified-Since", &t1)],
        )
        .await;
    assert_eq!(get.status(), 304);
    assert!(get.bytes().await.unwrap().is_empty());

    let get = host
        .get_with_headers(
            "/1.5/42/storage/bookmarks/a",
            &[("X-If-Modified-Since", "0.01")],
        )
        .await;
    assert_eq!(get.status(), 200);
}

#[tokio::test]
async fn test_both_precondition_headers_rejected() {
    let host = TestHost::start().await;
    let get = host
        .get_with_headers(
            "/1.5/42/storage/bookmarks",
            &[
                ("X-If-Modified-Since", "1.00"),
                ("X-If-Unmodified-Since", "1.00"),
            ],
        )
        .await;
    assert_eq!(get.status(), 400);
}

#[tokio::test]
async fn test_delete_item_flow() {
    let host = TestHost::start().await;
    host.put("/1.5/42/storage/bookmarks/a", r#"{"payload":"x"}"#)
        .await;
    let delete = host.delete("/1.5/42/storage/bookmarks/a").await;
    assert_eq!(delete.status(), 200);
    let t2 = body_json(delete).await.as_f64().unwrap();

    let get = host.get("/1.5/42/storage/bookmarks/a").await;
    assert_eq!(get.status(), 404);
    assert_eq!(body_json(get).await, json!(0));

    // The delete stamp is observable in info/collections.
    let info = body_json(host.get("/1.5/42/info/collections").await).await;
    assert_eq!(info["bookmarks"].as_f64().unwrap(), t2);
    let counts = body_json(host.get("/1.5/42/info/collection_counts").await).await;
    assert!(counts.get("bookmarks").is_none());
}

#[tokio::test]
async fn test_delete_missing_item_is_404() {
    let host = TestHost::start().await;
    let delete = host.delete("/1.5/42/storage/bookmarks/nope").await;
    assert_eq!(delete.status(), 404);
}

#[tokio::test]
async fn test_delete_storage_requires_confirmation() {
    let host = TestHost::start().await;
    host.put("/1.5/42/storage/bookmarks/a", r#"{"payload":"x"}"#)
        .await;

    let unconfirmed = host.delete("/1.5/42/storage").await;
    assert_eq!(unconfirmed.status(), 400);
    assert_eq!(host.get("/1.5/42/storage/bookmarks/a").await.status(), 200);

    let confirmed = host
        .delete_with_headers("/1.5/42/storage", &[("X-Confirm-Delete", "1")])
        .await;
    assert_eq!(confirmed.status(), 200);

    // Fresh-user behaviour afterwards.
    assert_eq!(host.get("/1.5/42/storage/bookmarks/a").await.status(), 404);
    let info = body_json(host.get("/1.5/42/info/collections").await).await;
    assert!(info.as_object().unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_posts_get_distinct_timestamps() {
    let host = TestHost::start().await;
    let (a, b) = tokio::join!(
        host.post(
            "/1.5/42/storage/bookmarks",
            r#"[{"id":"x","payload":"from-a"}]"#
        ),
        host.post(
            "/1.5/42/storage/bookmarks",
            r#"[{"id":"x","payload":"from-b"}]"#
        ),
    );
    assert_eq!(a.status(), 200);
    assert_eq!(b.status(), 200);
    let ta = header(&a, "X-Last-Modified").unwrap().to_string();
    let tb = header(&b, "X-Last-Modified").unwrap().to_string();
    assert_ne!(ta, tb);

    // The surviving payload is the one stamped later.
    let later = if ta > tb { "from-a" } else { "from-b" };
    let bso = body_json(host.get("/1.5/42/storage/bookmarks/x").await).await;
    assert_eq!(bso["payload"], later);
}

#[tokio::test]
async fn test_collection_listing_and_sorts() {
    let host = TestHost::start().await;
    for id in ["a", "b", "c"] {
        host.put(
            &format!("/1.5/42/storage/bookmarks/{id}"),
            r#"{"payload":"x"}"#,
        )
        .await;
    }

    let list = host.get("/1.5/42/storage/bookmarks").await;
    assert_eq!(header(&list, "X-Weave-Records"), Some("3"));
    assert_eq!(body_json(list).await, json!(["c", "b", "a"]));

    let oldest = body_json(host.get("/1.5/42/storage/bookmarks?sort=oldest").await).await;
    assert_eq!(oldest, json!(["a", "b", "c"]));

    let ids = body_json(host.get("/1.5/42/storage/bookmarks?ids=b,c").await).await;
    assert_eq!(ids.as_array().unwrap().len(), 2);

    let full = body_json(host.get("/1.5/42/storage/bookmarks?full").await).await;
    assert_eq!(full[0]["id"], "c");
    assert_eq!(full[0]["payload"], "x");
}

#[tokio::test]
async fn test_absent_collection_is_empty_not_404() {
    let host = TestHost::start().await;
    let get = host.get("/1.5/42/storage/neverwritten").await;
    assert_eq!(get.status(), 200);
    assert!(header(&get, "X-Last-Modified").is_none());
    assert_eq!(header(&get, "X-Weave-Records"), Some("0"));
    assert_eq!(body_json(get).await, json!([]));
}

#[tokio::test]
async fn test_pagination_never_duplicates() {
    let host = TestHost::start().await;
    let records: Vec<Value> = (0..10)
        .map(|i| json!({"id": format!("id{i:02}"), "payload": "x"}))
        .collect();
    host.post("/1.5/42/storage/bookmarks", &json!(records).to_string())
        .await;

    let mut seen = Vec::new();
    let mut path = "/1.5/42/storage/bookmarks?limit=3&sort=oldest".to_string();
    loop {
        let page = host.get(&path).await;
        let next = header(&page, "X-Weave-Next-Offset").map(str::to_string);
        let ids = body_json(page).await;
        for id in ids.as_array().unwrap() {
            seen.push(id.as_str().unwrap().to_string());
        }
        match next {
            Some(offset) => {
                path = format!("/1.5/42/storage/bookmarks?limit=3&sort=oldest&offset={offset}");
            }
            None => break,
        }
    }
    let expected: Vec<String> = (0..10).map(|i| format!("id{i:02}")).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_invalid_offset_is_400() {
    let host = TestHost::start().await;
    host.put("/1.5/42/storage/bookmarks/a", r#"{"payload":"x"}"#)
        .await;
    let get = host.get("/1.5/42/storage/bookmarks?offset=junk").await;
    assert_eq!(get.status(), 400);
}

#[tokio::test]
async fn test_newlines_rendering() {
    let host = TestHost::start().await;
    for id in ["a", "b"] {
        host.put(
            &format!("/1.5/42/storage/bookmarks/{id}"),
            r#"{"payload":"x"}"#,
        )
        .await;
    }
    let list = host
        .get_with_headers(
            "/1.5/42/storage/bookmarks?full",
            &[("Accept", "application/newlines")],
        )
        .await;
    assert_eq!(
        header(&list, "Content-Type"),
        Some("application/newlines")
    );
    let body = list.text().await.unwrap();
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 2);
    for line in lines {
        let value: Value = serde_json::from_str(line).unwrap();
        assert!(value["id"].is_string());
    }
}

#[tokio::test]
async fn test_weave_timestamp_on_every_response() {
    let host = TestHost::start().await;
    let get = host.get("/1.5/42/info/collections").await;
    assert!(header(&get, "X-Weave-Timestamp").is_some());
    let put = host
        .put("/1.5/42/storage/bookmarks/a", r#"{"payload":"x"}"#)
        .await;
    let weave: f64 = header(&put, "X-Weave-Timestamp").unwrap().parse().unwrap();
    let modified: f64 = header(&put, "X-Last-Modified").unwrap().parse().unwrap();
    assert!(weave >= modified);
}

#[tokio::test]
async fn test_backoff_header_when_configured() {
    let host = TestHost::builder()
        .with_settings(|settings| settings.server.backoff_seconds = 30)
        .start()
        .await;
    let get = host.get("/1.5/42/info/collections").await;
    assert_eq!(header(&get, "X-Weave-Backoff"), Some("30"));
}

#[tokio::test]
async fn test_uid_mismatch_is_invalid_user() {
    let host = TestHost::builder()
        .with_authenticator(Arc::new(StaticAuthenticator(7)))
        .start()
        .await;
    let get = host.get("/1.5/42/info/collections").await;
    assert_eq!(get.status(), 400);
    assert_eq!(body_json(get).await, json!(3));
    // The authenticated uid itself works.
    assert_eq!(host.get("/1.5/7/info/collections").await.status(), 200);
}

#[tokio::test]
async fn test_invalid_ids_in_urls() {
    let host = TestHost::start().await;
    assert_eq!(
        host.get("/1.5/42/storage/bad%20name").await.status(),
        400
    );
    let bad_item = host.get("/1.5/42/storage/bookmarks/bad%09tab").await;
    assert_eq!(bad_item.status(), 400);
    assert_eq!(body_json(bad_item).await, json!(2));
}

#[tokio::test]
async fn test_malformed_body_codes() {
    let host = TestHost::start().await;
    let put = host
        .put("/1.5/42/storage/bookmarks/a", "{not json")
        .await;
    assert_eq!(put.status(), 400);
    assert_eq!(body_json(put).await, json!(5));

    let put = host
        .put("/1.5/42/storage/bookmarks/a", r#"{"payload": 42}"#)
        .await;
    assert_eq!(put.status(), 400);
    assert_eq!(body_json(put).await, json!(6));

    // Body id must match the URL id.
    let put = host
        .put("/1.5/42/storage/bookmarks/a", r#"{"id":"b","payload":"x"}"#)
        .await;
    assert_eq!(put.status(), 400);
}

#[tokio::test]
async fn test_quota_enforcement() {
    let host = TestHost::builder()
        .with_settings(|settings| {
            settings.quota.quota_kb = 1;
            settings.limits.max_record_payload_bytes = 4096;
            settings.limits.max_post_bytes = 8192;
        })
        .start()
        .await;
    // 600 bytes fits inside the 1 KB quota.
    let put = host
        .put(
            "/1.5/42/storage/bookmarks/a",
            &json!({"payload": "x".repeat(600)}).to_string(),
        )
        .await;
    assert_eq!(put.status(), 200);
    // The low-space warning header appears under a megabyte remaining.
    assert!(header(&put, "X-Weave-Quota-Remaining").is_some());

    // Another 600 bytes does not.
    let put = host
        .put(
            "/1.5/42/storage/bookmarks/b",
            &json!({"payload": "x".repeat(600)}).to_string(),
        )
        .await;
    assert_eq!(put.status(), 403);
    assert_eq!(body_json(put).await, json!(4));

    let quota = body_json(host.get("/1.5/42/info/quota").await).await;
    assert!(quota[0].as_f64().unwrap() > 0.0);
    assert_eq!(quota[1].as_f64().unwrap(), 1.0);
}

#[tokio::test]
async fn test_daily_write_cap() {
    let host = TestHost::builder()
        .with_settings(|settings| settings.quota.daily_write_cap_bytes = 10)
        .start()
        .await;
    let put = host
        .put("/1.5/42/storage/bookmarks/a", r#"{"payload":"12345678"}"#)
        .await;
    assert_eq!(put.status(), 200);
    let put = host
        .put("/1.5/42/storage/bookmarks/b", r#"{"payload":"12345678"}"#)
        .await;
    assert_eq!(put.status(), 503);
    assert!(header(&put, "Retry-After").is_some());
}

#[tokio::test]
async fn test_ephemeral_collection() {
    let host = TestHost::builder()
        .with_settings(|settings| {
            settings.cache.ephemeral_collections = vec!["tabs".to_string()];
        })
        .start()
        .await;
    let put = host
        .put("/1.5/42/storage/tabs/t1", r#"{"payload":"tab one"}"#)
        .await;
    assert_eq!(put.status(), 200);

    let bso = body_json(host.get("/1.5/42/storage/tabs/t1").await).await;
    assert_eq!(bso["payload"], "tab one");

    let info = body_json(host.get("/1.5/42/info/collections").await).await;
    assert!(info["tabs"].is_number());
    let counts = body_json(host.get("/1.5/42/info/collection_counts").await).await;
    assert_eq!(counts["tabs"], 1);
    // Memory-resident data never counts against quota.
    let quota = body_json(host.get("/1.5/42/info/quota").await).await;
    assert_eq!(quota[0].as_f64().unwrap(), 0.0);

    let delete = host.delete("/1.5/42/storage/tabs/t1").await;
    assert_eq!(delete.status(), 200);
    assert_eq!(host.get("/1.5/42/storage/tabs/t1").await.status(), 404);
}

#[tokio::test]
async fn test_info_configuration() {
    let host = TestHost::start().await;
    let config = body_json(host.get("/1.5/42/info/configuration").await).await;
    assert_eq!(config["max_post_records"], 100);
    assert_eq!(config["max_post_bytes"], 1_048_576);
    assert_eq!(config["max_record_payload_bytes"], 262_144);
    assert_eq!(config["max_id_length"], 64);
}

#[tokio::test]
async fn test_site_root_and_heartbeat() {
    let host = TestHost::start().await;
    let root = host.get("/").await;
    assert_eq!(root.status(), 200);
    assert!(root.text().await.unwrap().contains("syncstore"));
    assert_eq!(host.get("/__lbheartbeat__").await.status(), 200);
}

#[tokio::test]
async fn test_unknown_fields_rejected_on_write() {
    let host = TestHost::start().await;
    let put = host
        .put(
            "/1.5/42/storage/bookmarks/a",
            r#"{"payload":"x","surprise":true}"#,
        )
        .await;
    assert_eq!(put.status(), 400);
    assert_eq!(body_json(put).await, json!(6));

    // Legacy fields pass silently and are omitted from reads.
    let put = host
        .put(
            "/1.5/42/storage/bookmarks/a",
            r#"{"payload":"x","parentid":"menu"}"#,
        )
        .await;
    assert_eq!(put.status(), 200);
    let bso = body_json(host.get("/1.5/42/storage/bookmarks/a").await).await;
    assert!(bso.get("parentid").is_none());
}
