//! Mounts a creator catalog on a wiremock server in the `/api/v1` layout.

use serde_json::json;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const SERVICE: &str = "svc";

pub fn catalog_path(user_id: &str) -> String {
    format!("/api/v1/{SERVICE}/user/{user_id}/posts")
}

pub fn post_path(user_id: &str, post_id: &str) -> String {
    format!("/api/v1/{SERVICE}/user/{user_id}/post/{post_id}")
}

pub fn data_path(post_id: &str, name: &str) -> String {
    format!("/data/{post_id}/{name}")
}

/// Serves `ids` as the catalog page at `offset`.
pub async fn mount_page(server: &MockServer, user_id: &str, offset: u64, ids: &[String]) {
    let listed: Vec<_> = ids.iter().map(|id| json!({ "id": id })).collect();
    let mock = Mock::given(method("GET")).and(path(catalog_path(user_id)));
    let mock = if offset == 0 {
        mock.and(query_param_is_missing("o"))
    } else {
        mock.and(query_param("o", offset.to_string()))
    };
    mock.respond_with(ResponseTemplate::new(200).set_body_json(json!(listed)))
        .mount(server)
        .await;
}

/// Serves the post page for `post_id` listing `files` as attachments.
pub async fn mount_post(server: &MockServer, user_id: &str, post_id: &str, files: &[&str]) {
    let attachments: Vec<_> = files
        .iter()
        .map(|name| json!({ "name": name, "path": format!("/{post_id}/{name}") }))
        .collect();
    Mock::given(method("GET"))
        .and(path(post_path(user_id, post_id)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "post": { "attachments": attachments } })),
        )
        .mount(server)
        .await;
}

pub fn file_bytes(post_id: &str, name: &str) -> Vec<u8> {
    format!("image {post_id}/{name}").into_bytes()
}

/// Serves every file of `post_id` as a small PNG body.
pub async fn mount_files(server: &MockServer, post_id: &str, files: &[&str]) {
    for name in files {
        Mock::given(path(data_path(post_id, name)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(file_bytes(post_id, name))
                    .insert_header("Content-Type", "image/png"),
            )
            .mount(server)
            .await;
    }
}

/// Mounts `post_count` posts split into pages of `page_size`, followed by an
/// empty page, each post carrying `files`. Returns the post ids in order.
pub async fn mount_catalog(
    server: &MockServer,
    user_id: &str,
    post_count: usize,
    page_size: usize,
    files: &[&str],
) -> Vec<String> {
    let ids: Vec<String> = (1..=post_count).map(|n| format!("p{n}")).collect();
    let mut offset = 0u64;
    for chunk in ids.chunks(page_size) {
        mount_page(server, user_id, offset, chunk).await;
        offset += page_size as u64;
    }
    mount_page(server, user_id, offset, &[]).await;
    for id in &ids {
        mount_post(server, user_id, id, files).await;
        mount_files(server, id, files).await;
    }
    ids
}

/// Number of requests the server saw whose path starts with `prefix`.
pub async fn requests_under(server: &MockServer, prefix: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path().starts_with(prefix))
        .count()
}
