use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use coap_lite::{CoapOption, MessageClass, MessageType, RequestType, ResponseType};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use coap_client::u24::u24;
use coap_client::{ClientConfig, ClientError, CoapClient, Endpoint, Message, Notification};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Minimal server answering `/hello`, `/.s` and `/obs` on a loopback socket.  Notifications for
/// `/obs` are pushed whenever a sequence number arrives on the returned channel.
async fn spawn_server() -> (u16, mpsc::UnboundedSender<u32>) {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let port = socket.local_addr().unwrap().port();
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<u32>();
    let observer: Arc<Mutex<Option<(SocketAddr, Vec<u8>)>>> = Arc::default();

    let pusher_socket = socket.clone();
    let pusher_observer = observer.clone();
    tokio::spawn(async move {
        let mut message_id = 0x8000;
        while let Some(sequence) = notify_rx.recv().await {
            let target = pusher_observer.lock().unwrap().clone();
            if let Some((peer, token)) = target {
                message_id += 1;
                let mut notification = Message::new(
                    MessageType::NonConfirmable,
                    MessageClass::Response(ResponseType::Content),
                );
                notification.message_id = message_id;
                notification.token = token;
                notification.set_observe(u24::try_from(sequence).unwrap());
                notification.payload = sequence.to_string().into_bytes();
                let bytes = notification.encode().unwrap();
                pusher_socket.send_to(&bytes, peer).await.unwrap();
            }
        }
    });

    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        loop {
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let request = match Message::decode(&buf[..len]) {
                Ok(request) => request,
                Err(_) => continue,
            };
            if request.message_type != MessageType::Confirmable {
                continue;
            }
            let (code, payload) = match (request.class(), request.path().as_str()) {
                (MessageClass::Request(RequestType::Get), "/hello") => {
                    (ResponseType::Content, b"world".to_vec())
                }
                (MessageClass::Request(RequestType::Post), "/.s") => {
                    (ResponseType::Changed, Vec::new())
                }
                (MessageClass::Request(RequestType::Get), "/obs") => {
                    *observer.lock().unwrap() = Some((peer, request.token.clone()));
                    (ResponseType::Content, b"2".to_vec())
                }
                _ => (ResponseType::NotFound, Vec::new()),
            };
            let mut reply = Message::new(MessageType::Acknowledgement, MessageClass::Response(code));
            reply.message_id = request.message_id;
            reply.token = request.token.clone();
            reply.payload = payload;
            if request.path() == "/obs" && request.get_first_option(CoapOption::Observe).is_some() {
                reply.set_observe(u24::from(2u8));
            }
            socket.send_to(&reply.encode().unwrap(), peer).await.unwrap();
        }
    });

    (port, notify_tx)
}

async fn connect(port: u16) -> CoapClient {
    let client = CoapClient::new(Endpoint::new("127.0.0.1", port), ClientConfig::new());
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn get_and_post_over_udp() {
    let (port, _notify_tx) = spawn_server().await;
    let client = connect(port).await;

    let response = client.get("/hello", TIMEOUT).await.unwrap();
    assert_eq!(response.code, 69);
    assert_eq!(response.body, b"world");

    let response = client
        .post("/.s", "application/json", "{}", TIMEOUT)
        .await
        .unwrap();
    assert_eq!(response.code, 68);
    assert!(response.body.is_empty());

    let response = client.get("/missing", TIMEOUT).await.unwrap();
    assert_eq!(response.code_string(), "4.04");
    assert!(!response.is_success());

    client.close().await.unwrap();
    client.close().await.unwrap();
    assert!(matches!(
        client.get("/hello", TIMEOUT).await,
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test]
async fn observe_over_udp() {
    let (port, notify_tx) = spawn_server().await;
    let client = connect(port).await;

    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let handle = client
        .observe("/obs", TIMEOUT, move |n: Notification| {
            seen_tx.send(String::from_utf8(n.body)?)?;
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(seen_rx.recv().await.unwrap(), "2");

    for sequence in [3, 1, 5, 4] {
        notify_tx.send(sequence).unwrap();
    }
    // Loopback keeps datagram order.
    assert_eq!(seen_rx.recv().await.unwrap(), "3");
    assert_eq!(seen_rx.recv().await.unwrap(), "5");
    assert_eq!(seen_rx.recv().await.unwrap(), "4");

    assert!(handle.cancel().await);
    client.close().await.unwrap();
}

#[tokio::test]
async fn silent_server_times_out() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();
    let client = connect(port).await;

    let started = std::time::Instant::now();
    let result = client.get("/hello", Duration::from_millis(300)).await;
    assert!(matches!(result, Err(ClientError::Timeout(_))));
    assert!(started.elapsed() >= Duration::from_millis(300));
    client.close().await.unwrap();
}
