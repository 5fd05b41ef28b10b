//! Shared fake voice server for gateway and controller tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message;

pub(crate) struct FakeVoiceServer {
    listener: TcpListener,
    pub(crate) udp_port: u16,
    pub(crate) discovery_count: Arc<AtomicU32>,
    rtp: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl FakeVoiceServer {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let udp = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let udp_port = udp.local_addr().unwrap().port();
        let discovery_count = Arc::new(AtomicU32::new(0));
        let (rtp_tx, rtp_rx) = tokio::sync::mpsc::unbounded_channel();

        // answer discovery requests; forward everything else for inspection
        let count = discovery_count.clone();
        tokio::spawn(async move {
            loop {
                let mut buf = vec![0u8; 2048];
                let Ok((n, from)) = udp.recv_from(&mut buf).await else {
                    break;
                };
                buf.truncate(n);
                if n == 74 && buf[0..2] == [0x00, 0x01] {
                    count.fetch_add(1, Ordering::SeqCst);
                    let mut reply = [0u8; 74];
                    reply[0..2].copy_from_slice(&[0x00, 0x02]);
                    reply[8..17].copy_from_slice(b"127.0.0.1");
                    reply[72..74].copy_from_slice(&from.port().to_be_bytes());
                    let _ = udp.send_to(&reply, from).await;
                } else if rtp_tx.send(buf).is_err() {
                    break;
                }
            }
        });

        Self {
            listener,
            udp_port,
            discovery_count,
            rtp: tokio::sync::Mutex::new(rtp_rx),
        }
    }

    pub(crate) fn endpoint(&self) -> String {
        format!("ws://{}", self.listener.local_addr().unwrap())
    }

    pub(crate) async fn accept(&self) -> WebSocketStream<TcpStream> {
        let (stream, _) = self.listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    /// Next non-discovery datagram (RTP/RTCP) the server received.
    pub(crate) async fn recv_rtp(&self) -> Vec<u8> {
        let mut rx = self.rtp.lock().await;
        tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for media packet")
            .expect("udp task ended")
    }
}

pub(crate) async fn read_op(ws: &mut WebSocketStream<TcpStream>) -> (u8, Value) {
    loop {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for client frame")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            let v: Value = serde_json::from_str(text.as_str()).unwrap();
            return (v["op"].as_u64().unwrap() as u8, v["d"].clone());
        }
    }
}

pub(crate) async fn send_op(ws: &mut WebSocketStream<TcpStream>, op: u8, d: Value) {
    let frame = serde_json::to_string(&json!({"op": op, "d": d})).unwrap();
    ws.send(Message::Text(frame.into())).await.unwrap();
}

/// Drives one client through identify → hello → ready → select protocol →
/// ack, leaving the socket open.
pub(crate) async fn handshake(
    server: &FakeVoiceServer,
    expect_server_id: &str,
    expect_token: &str,
) -> WebSocketStream<TcpStream> {
    let mut ws = server.accept().await;

    let (op, d) = read_op(&mut ws).await;
    assert_eq!(op, 0, "expected IDENTIFY, got op {op}");
    assert_eq!(d["server_id"], expect_server_id);
    assert_eq!(d["token"], expect_token);
    assert_eq!(d["video"], true);

    send_op(&mut ws, 8, json!({"heartbeat_interval": 60000.0})).await;
    send_op(
        &mut ws,
        2,
        json!({
            "ssrc": 4242,
            "ip": "127.0.0.1",
            "port": server.udp_port,
            "modes": ["aead_aes256_gcm_rtpsize", "aead_xchacha20_poly1305_rtpsize"],
            "streams": [{"ssrc": 4243, "rtx_ssrc": 4244}],
        }),
    )
    .await;

    let (op, d) = read_op(&mut ws).await;
    assert_eq!(op, 1, "expected SELECT_PROTOCOL, got op {op}");
    assert_eq!(d["protocol"], "udp");
    assert_eq!(d["data"]["mode"], "aead_aes256_gcm_rtpsize");
    assert_eq!(d["data"]["address"], "127.0.0.1");
    assert_eq!(d["codecs"].as_array().unwrap().len(), 6);

    send_op(
        &mut ws,
        4,
        json!({
            "mode": "aead_aes256_gcm_rtpsize",
            "secret_key": vec![0u8; 32],
        }),
    )
    .await;
    ws
}
