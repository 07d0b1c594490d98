use std::{net::SocketAddr, sync::Arc, time::Duration};

use poll_ledger::{build_router, guard::IdentityStrategy, store::MemoryStore, AppState, Config};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn spawn_app(config: Config) -> SocketAddr {
    let state = AppState::new(Arc::new(MemoryStore::new()), config);
    let app = build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve app")
    });
    addr
}

fn proxied() -> Config {
    Config {
        trust_forwarded_for: true,
        ..Config::default()
    }
}

fn request_head(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: Option<&str>,
) -> String {
    let mut req = format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n");
    for (k, v) in headers {
        req.push_str(&format!("{k}: {v}\r\n"));
    }
    if let Some(body) = body {
        req.push_str("Content-Type: application/json\r\n");
        req.push_str(&format!("Content-Length: {}\r\n", body.len()));
    } else if method != "GET" {
        req.push_str("Content-Length: 0\r\n");
    }
    req.push_str("\r\n");
    req.push_str(body.unwrap_or_default());
    req
}

async fn send_raw(
    addr: SocketAddr,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: Option<&str>,
) -> (u16, Value) {
    let mut stream = TcpStream::connect(addr).await.expect("connect server");
    stream
        .write_all(request_head(addr, method, path, headers, body).as_bytes())
        .await
        .expect("write request");
    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("read response");
    let (head, body) = response
        .split_once("\r\n\r\n")
        .expect("http response must have separator");
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse::<u16>().ok())
        .expect("http status");
    let json = if body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
    };
    (status, json)
}

async fn create_poll(addr: SocketAddr, options: &[&str]) -> Value {
    let body = json!({
        "title": "Favourite season",
        "description": "Pick one",
        "options": options,
        "creator_email": "host@example.org"
    })
    .to_string();
    let (status, poll) = send_raw(addr, "POST", "/api/polls", &[], Some(&body)).await;
    assert_eq!(status, 201, "create poll: {poll}");
    poll
}

async fn vote(addr: SocketAddr, poll: &Value, option: usize, voter_ip: &str) -> (u16, Value) {
    let body = json!({
        "poll_id": poll["id"],
        "option_id": poll["options"][option]["id"],
    })
    .to_string();
    send_raw(
        addr,
        "POST",
        "/api/votes",
        &[("X-Forwarded-For", voter_ip)],
        Some(&body),
    )
    .await
}

fn option_id(poll: &Value, option: usize) -> String {
    poll["options"][option]["id"]
        .as_str()
        .expect("option id")
        .to_string()
}

#[tokio::test]
async fn health_reports_backend() {
    let addr = spawn_app(Config::default()).await;
    let (status, body) = send_raw(addr, "GET", "/health", &[], None).await;
    assert_eq!(status, 200);
    assert_eq!(body["store"], "memory");
}

#[tokio::test]
async fn one_vote_per_voter_and_consistent_tallies() {
    let addr = spawn_app(proxied()).await;
    let poll = create_poll(addr, &["Spring", "Autumn"]).await;
    let id = poll["id"].as_str().expect("poll id").to_string();
    let (a, b) = (option_id(&poll, 0), option_id(&poll, 1));
    assert_eq!(poll["total_votes"], 0);
    assert_eq!(poll["options"][1]["position"], 1);

    let (status, body) = vote(addr, &poll, 0, "198.51.100.1").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["tallies"]["counts"][&a], 1);
    assert_eq!(body["tallies"]["counts"][&b], 0);
    assert_eq!(body["tallies"]["total"], 1);

    let (status, body) = vote(addr, &poll, 1, "198.51.100.1").await;
    assert_eq!(status, 409);
    assert_eq!(body["code"], "DuplicateVote");
    assert_eq!(body["error"], "You have already voted on this poll");

    let (status, body) = vote(addr, &poll, 1, "198.51.100.2").await;
    assert_eq!(status, 200);
    assert_eq!(body["tallies"]["total"], 2);

    let (status, tallies) = send_raw(addr, "GET", &format!("/api/polls/{id}/tallies"), &[], None).await;
    assert_eq!(status, 200);
    assert_eq!(tallies["counts"][&a], 1);
    assert_eq!(tallies["counts"][&b], 1);
    assert_eq!(tallies["total"], 2);

    let (status, stored) = send_raw(addr, "GET", &format!("/api/polls/{id}"), &[], None).await;
    assert_eq!(status, 200);
    let sum: i64 = stored["options"]
        .as_array()
        .expect("options")
        .iter()
        .map(|o| o["vote_count"].as_i64().expect("vote count"))
        .sum();
    assert_eq!(stored["total_votes"].as_i64(), Some(sum));

    let (status, rebuilt) = send_raw(addr, "POST", &format!("/api/polls/{id}/reconcile"), &[], None).await;
    assert_eq!(status, 200);
    assert_eq!(rebuilt, tallies);

    let path = format!("/api/polls/{id}/vote-status");
    let (_, status_body) = send_raw(addr, "GET", &path, &[("X-Forwarded-For", "198.51.100.1")], None).await;
    assert_eq!(status_body["has_voted"], true);
    let (_, status_body) = send_raw(addr, "GET", &path, &[("X-Forwarded-For", "198.51.100.3")], None).await;
    assert_eq!(status_body["has_voted"], false);
}

#[tokio::test]
async fn option_count_limits() {
    let addr = spawn_app(Config::default()).await;

    for options in [vec!["only"], vec!["1", "2", "3", "4", "5", "6", "7"]] {
        let body = json!({ "title": "Too few or many", "options": options }).to_string();
        let (status, err) = send_raw(addr, "POST", "/api/polls", &[], Some(&body)).await;
        assert_eq!(status, 400);
        assert_eq!(err["code"], "ValidationError");
    }

    create_poll(addr, &["1", "2"]).await;
    create_poll(addr, &["1", "2", "3", "4", "5", "6"]).await;
}

#[tokio::test]
async fn malformed_requests_are_validation_errors() {
    let addr = spawn_app(Config::default()).await;

    let (status, err) = send_raw(addr, "POST", "/api/polls", &[], Some("{not json")).await;
    assert_eq!(status, 400);
    assert_eq!(err["code"], "ValidationError");

    let (status, err) = send_raw(addr, "GET", "/api/polls/not-a-uuid", &[], None).await;
    assert_eq!(status, 400);
    assert_eq!(err["code"], "ValidationError");

    let (status, err) = send_raw(addr, "GET", "/api/polls?cursor=bogus", &[], None).await;
    assert_eq!(status, 400);
    assert_eq!(err["code"], "ValidationError");
}

#[tokio::test]
async fn option_of_another_poll_changes_nothing() {
    let addr = spawn_app(proxied()).await;
    let poll = create_poll(addr, &["Spring", "Autumn"]).await;
    let other = create_poll(addr, &["Tea", "Coffee"]).await;

    let body = json!({ "poll_id": poll["id"], "option_id": other["options"][0]["id"] }).to_string();
    let (status, err) = send_raw(
        addr,
        "POST",
        "/api/votes",
        &[("X-Forwarded-For", "198.51.100.1")],
        Some(&body),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(err["code"], "ValidationError");

    for id in [&poll["id"], &other["id"]] {
        let id = id.as_str().expect("poll id");
        let (_, tallies) = send_raw(addr, "GET", &format!("/api/polls/{id}/tallies"), &[], None).await;
        assert_eq!(tallies["total"], 0);
    }
}

#[tokio::test]
async fn deleted_poll_is_gone() {
    let addr = spawn_app(proxied()).await;
    let poll = create_poll(addr, &["Spring", "Autumn"]).await;
    let id = poll["id"].as_str().expect("poll id").to_string();
    vote(addr, &poll, 0, "198.51.100.1").await;

    let (status, body) = send_raw(addr, "DELETE", &format!("/api/polls/{id}"), &[], None).await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);

    let (status, err) = send_raw(addr, "GET", &format!("/api/polls/{id}"), &[], None).await;
    assert_eq!(status, 404);
    assert_eq!(err["code"], "NotFound");

    for option in 0..2 {
        let (status, _) = vote(addr, &poll, option, "198.51.100.9").await;
        assert!(status == 404 || status == 400, "vote after delete got {status}");
    }

    let (status, _) = send_raw(addr, "DELETE", &format!("/api/polls/{id}"), &[], None).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn closed_poll_rejects_votes_and_leaves_listing() {
    let addr = spawn_app(proxied()).await;
    let open = create_poll(addr, &["Spring", "Autumn"]).await;
    let closed = create_poll(addr, &["Tea", "Coffee"]).await;
    let closed_id = closed["id"].as_str().expect("poll id");

    let (status, body) = send_raw(addr, "POST", &format!("/api/polls/{closed_id}/close"), &[], None).await;
    assert_eq!(status, 200);
    assert_eq!(body["is_active"], false);

    let (status, err) = vote(addr, &closed, 0, "198.51.100.1").await;
    assert_eq!(status, 409);
    assert_eq!(err["code"], "PollClosed");

    let (status, page) = send_raw(addr, "GET", "/api/polls", &[], None).await;
    assert_eq!(status, 200);
    let ids: Vec<&Value> = page["polls"].as_array().expect("polls").iter().map(|p| &p["id"]).collect();
    assert_eq!(ids, vec![&open["id"]]);
}

#[tokio::test]
async fn listing_pages_newest_first() {
    let addr = spawn_app(Config::default()).await;
    let mut created = Vec::new();
    for _ in 0..3 {
        created.push(create_poll(addr, &["yes", "no"]).await);
    }

    let (status, first) = send_raw(addr, "GET", "/api/polls?limit=2", &[], None).await;
    assert_eq!(status, 200);
    assert_eq!(first["polls"].as_array().expect("polls").len(), 2);
    let cursor = first["next_cursor"].as_str().expect("cursor").to_string();

    let (status, second) = send_raw(addr, "GET", &format!("/api/polls?limit=2&cursor={cursor}"), &[], None).await;
    assert_eq!(status, 200);
    assert_eq!(second["polls"].as_array().expect("polls").len(), 1);
    assert!(second["next_cursor"].is_null());

    let mut listed: Vec<Value> = first["polls"].as_array().expect("polls").clone();
    listed.extend(second["polls"].as_array().expect("polls").iter().cloned());
    let mut listed_ids: Vec<&Value> = listed.iter().map(|p| &p["id"]).collect();
    let mut created_ids: Vec<&Value> = created.iter().map(|p| &p["id"]).collect();
    listed_ids.sort_by_key(|v| v.to_string());
    created_ids.sort_by_key(|v| v.to_string());
    assert_eq!(listed_ids, created_ids);
}

#[tokio::test]
async fn token_identity_strategy() {
    let addr = spawn_app(Config {
        voter_identity: IdentityStrategy::ClientToken,
        ..Config::default()
    })
    .await;
    let poll = create_poll(addr, &["Spring", "Autumn"]).await;
    let body = json!({ "poll_id": poll["id"], "option_id": poll["options"][0]["id"] }).to_string();

    let (status, err) = send_raw(addr, "POST", "/api/votes", &[], Some(&body)).await;
    assert_eq!(status, 400);
    assert_eq!(err["code"], "ValidationError");

    let token = [("X-Voter-Token", "device-1")];
    let (status, _) = send_raw(addr, "POST", "/api/votes", &token, Some(&body)).await;
    assert_eq!(status, 200);
    let (status, err) = send_raw(addr, "POST", "/api/votes", &token, Some(&body)).await;
    assert_eq!(status, 409);
    assert_eq!(err["code"], "DuplicateVote");

    // Every client shares 127.0.0.1 here; only the token tells them apart.
    let (status, _) = send_raw(addr, "POST", "/api/votes", &[("X-Voter-Token", "device-2")], Some(&body)).await;
    assert_eq!(status, 200);
}

async fn read_until(stream: &mut TcpStream, seen: &mut String, needle: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut chunk = [0u8; 1024];
        while !seen.contains(needle) {
            let n = stream.read(&mut chunk).await.expect("read event stream");
            assert!(n > 0, "event stream ended before `{needle}`");
            seen.push_str(&String::from_utf8_lossy(&chunk[..n]));
        }
    })
    .await
    .expect("timed out waiting for event");
}

#[tokio::test]
async fn live_tallies_stream_until_poll_is_deleted() {
    let addr = spawn_app(proxied()).await;
    let poll = create_poll(addr, &["Spring", "Autumn"]).await;
    let id = poll["id"].as_str().expect("poll id").to_string();

    let mut events = TcpStream::connect(addr).await.expect("connect server");
    events
        .write_all(request_head(addr, "GET", &format!("/api/polls/{id}/events"), &[], None).as_bytes())
        .await
        .expect("write request");

    let mut seen = String::new();
    read_until(&mut events, &mut seen, "event: snapshot").await;
    assert!(seen.contains("text/event-stream"));

    let (status, _) = vote(addr, &poll, 1, "198.51.100.1").await;
    assert_eq!(status, 200);
    read_until(&mut events, &mut seen, "event: tally").await;
    read_until(&mut events, &mut seen, "\"total_votes\":1").await;

    // Rejected votes publish nothing.
    let (status, _) = vote(addr, &poll, 0, "198.51.100.1").await;
    assert_eq!(status, 409);
    let (status, _) = vote(addr, &poll, 0, "198.51.100.2").await;
    assert_eq!(status, 200);
    read_until(&mut events, &mut seen, "\"total_votes\":2").await;
    assert_eq!(seen.matches("event: tally").count(), 2);

    let (status, _) = send_raw(addr, "DELETE", &format!("/api/polls/{id}"), &[], None).await;
    assert_eq!(status, 200);

    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), events.read_to_end(&mut rest))
        .await
        .expect("stream should end after delete")
        .expect("read rest of stream");
}

#[tokio::test]
async fn events_for_unknown_poll_are_not_found() {
    let addr = spawn_app(Config::default()).await;
    let path = format!("/api/polls/{}/events", uuid::Uuid::new_v4());
    let (status, err) = send_raw(addr, "GET", &path, &[], None).await;
    assert_eq!(status, 404);
    assert_eq!(err["code"], "NotFound");
}
