// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// Raw connection for inspecting streams behind the broker's back.
pub async fn raw_connection(url: &str) -> redis::aio::MultiplexedConnection {
    let client = redis::Client::open(url).unwrap();
    client.get_multiplexed_async_connection().await.unwrap()
}

/// Append an entry with arbitrary fields, bypassing the broker.
pub async fn xadd_fields(url: &str, topic: &str, fields: &[(&str, &[u8])]) -> String {
    use redis::AsyncCommands;
    let mut conn = raw_connection(url).await;
    conn.xadd(topic, "*", fields).await.unwrap()
}

/// Number of entries in a stream (0 if it does not exist).
pub async fn xlen(url: &str, topic: &str) -> usize {
    use redis::AsyncCommands;
    let mut conn = raw_connection(url).await;
    conn.xlen(topic).await.unwrap()
}

/// Read every entry of a stream as `(id, fields)`.
pub async fn read_all(url: &str, topic: &str) -> Vec<(String, Vec<(String, Vec<u8>)>)> {
    use redis::streams::StreamRangeReply;
    use redis::AsyncCommands;

    let mut conn = raw_connection(url).await;
    let reply: StreamRangeReply = conn.xrange_all(topic).await.unwrap();
    reply
        .ids
        .into_iter()
        .map(|entry| {
            let mut fields: Vec<(String, Vec<u8>)> = entry
                .map
                .iter()
                .filter_map(|(k, v)| redis::from_redis_value::<Vec<u8>>(v).ok().map(|b| (k.clone(), b)))
                .collect();
            fields.sort();
            (entry.id, fields)
        })
        .collect()
}
