//! End-to-end tests: a live listener, the real engine, a disk store.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use greylag::center::Center;
use greylag::config::Spec;
use greylag::policy;
use greylag::server::{Listener, PolicyServer};

/// Spin up a server from a TOML fragment.
async fn start(toml: &str) -> (Arc<Center>, watch::Sender<bool>, JoinHandle<()>) {
    let config = toml::from_str::<Spec>(toml).unwrap().parse().unwrap();
    let center = Center::connect(config).await.unwrap();
    let listener = Listener::bind(&center.config.listen).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(PolicyServer::new(center.clone(), listener).run(shutdown_rx));
    (center, shutdown_tx, handle)
}

/// One request/response exchange over the unix socket.
async fn ask(socket: &Path, attrs: &[(&str, &str)]) -> String {
    let mut stream = UnixStream::connect(socket).await.unwrap();
    exchange(&mut stream, attrs).await
}

async fn exchange<S>(stream: &mut S, attrs: &[(&str, &str)]) -> String
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    let mut request = String::new();
    for (name, value) in attrs {
        request.push_str(name);
        request.push('=');
        request.push_str(value);
        request.push('\n');
    }
    request.push('\n');
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

fn policy_attrs<'a>(sender: &'a str, recipient: &'a str) -> Vec<(&'a str, &'a str)> {
    vec![
        ("request", "smtpd_access_policy"),
        ("protocol_state", "RCPT"),
        ("client_address", "192.0.2.44"),
        ("client_name", "mail.example.com"),
        ("sender", sender),
        ("recipient", recipient),
    ]
}

fn base_config(dir: &tempfile::TempDir) -> String {
    format!(
        r#"
        [listen]
        type = "unix"
        path = "{dir}/policy.sock"

        [greylist]
        store = "sled://{dir}/grey"
        delay = 60
        hostname = "mx.test"
        "#,
        dir = dir.path().display(),
    )
}

#[tokio::test]
async fn a_sender_greylists_then_passes_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("policy.sock");
    let (center, shutdown_tx, handle) = start(&base_config(&dir)).await;

    // First contact: deferred with the full wait.
    let response = ask(&socket, &policy_attrs("alice@example.com", "bob@other.test")).await;
    assert_eq!(
        response,
        "action=DEFER_IF_PERMIT Greylisted, please retry in 60 seconds\n\n"
    );

    // Backdate the recorded attempt past the delay, as if the client were
    // retrying an hour later.
    let key = policy::grey_key(
        "192.0.0.0/20",
        "alice@example.com",
        "bob@other.test",
        center.config.greylist.hash_keys,
    );
    let now = jiff::Timestamp::now().as_second();
    center
        .greylist
        .update(&key, &format!("0,{}", now - 3600))
        .await
        .unwrap();

    let response = ask(&socket, &policy_attrs("alice@example.com", "bob@other.test")).await;
    assert!(
        response.starts_with("action=PREPEND X-Greylist: delayed 3600 seconds at mx.test; "),
        "{response}"
    );
    assert!(response.ends_with("\n\n"), "{response}");

    // From here on the tuple is known and the answer is neutral.
    let response = ask(&socket, &policy_attrs("alice@example.com", "bob@other.test")).await;
    assert_eq!(response, "action=DUNNO\n\n");

    // Drain-shutdown unlinks the socket.
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
    assert!(!socket.exists());
}

#[tokio::test]
async fn bounce_tags_and_extensions_collapse_to_one_tuple() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("policy.sock");
    let (center, shutdown_tx, handle) = start(&base_config(&dir)).await;

    let response = ask(
        &socket,
        &policy_attrs("prvs=1234567890=alice@example.com", "bob+spam@other.test"),
    )
    .await;
    assert!(response.starts_with("action=DEFER_IF_PERMIT "), "{response}");

    // The entry was recorded under the cleaned sender; the recipient keeps
    // its extension.
    let key = policy::grey_key(
        "192.0.0.0/20",
        "alice@example.com",
        "bob+spam@other.test",
        center.config.greylist.hash_keys,
    );
    assert!(center.greylist.get(&key).await.unwrap().is_some());

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn whitelisted_recipients_skip_the_greylist() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("policy.sock");

    let whitelist = dir.path().join("whitelist.json");
    std::fs::write(
        &whitelist,
        r#"{"local": [{"type": "recipient_literal", "recipient": "@ours.test"}]}"#,
    )
    .unwrap();

    let toml = format!(
        "{}\n[whitelist]\nsources = [\"file://{}\"]\n",
        base_config(&dir),
        whitelist.display(),
    );
    let (center, shutdown_tx, handle) = start(&toml).await;

    let response = ask(&socket, &policy_attrs("alice@example.com", "bob@ours.test")).await;
    assert_eq!(response, "action=DUNNO\n\n");

    // No trace in the greylist store.
    assert!(
        center
            .greylist
            .scan(|_, _| true)
            .await
            .unwrap()
            .is_empty()
    );

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn protocol_garbage_is_answered_neutrally() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("policy.sock");
    let (_center, shutdown_tx, handle) = start(&base_config(&dir)).await;

    let mut stream = UnixStream::connect(&socket).await.unwrap();
    stream.write_all(b"this line has no equals sign\n").await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert_eq!(response, "action=DUNNO\n\n");

    // An incomplete request is neutral too.
    let response = ask(&socket, &[("request", "smtpd_access_policy")]).await;
    assert_eq!(response, "action=DUNNO\n\n");

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn a_tcp_listener_serves_the_same_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let toml = format!(
        r#"
        [listen]
        type = "tcp"
        addr = "127.0.0.1:0"

        [greylist]
        store = "sled://{dir}/grey"
        delay = 60
        hostname = "mx.test"
        "#,
        dir = dir.path().display(),
    );

    let config = toml::from_str::<Spec>(&toml).unwrap().parse().unwrap();
    let center = Center::connect(config).await.unwrap();
    let listener = Listener::bind(&center.config.listen).unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(PolicyServer::new(center, listener).run(shutdown_rx));

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let response = exchange(&mut stream, &policy_attrs("alice@example.com", "bob@other.test")).await;
    assert!(response.starts_with("action=DEFER_IF_PERMIT "), "{response}");

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
