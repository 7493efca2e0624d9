//! The XML command server against a running stack

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use voxstack::{
    CommandHandler, CommandResponse, CommandServer, SipStack, StackHandle, TransportConfig,
    TransportKind, XmlRequest,
};

struct Dialer;

impl CommandHandler for Dialer {
    fn click_to_call(&self, request: &XmlRequest, _stack: &StackHandle) -> CommandResponse {
        match request.child("initiator") {
            Some(initiator) => CommandResponse::ok("Click to call initiated.").with_data(initiator),
            None => CommandResponse::error(400, "Missing initiator."),
        }
    }

    fn initial_sync(&self, _request: &XmlRequest, _stack: &StackHandle) -> CommandResponse {
        CommandResponse::ok("Sync complete.")
    }
}

fn start_stack() -> SipStack {
    SipStack::builder()
        .transport(TransportConfig {
            interface: "127.0.0.1".to_string(),
            ..TransportConfig::new(TransportKind::Udp, 0)
        })
        .start()
        .unwrap()
}

async fn start_server(stack: &SipStack, handler: Option<Arc<dyn CommandHandler>>) -> SocketAddr {
    let mut server = CommandServer::bind("127.0.0.1:0", stack.handle()).await.unwrap();
    if let Some(handler) = handler {
        server = server.with_handler(handler);
    }
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());
    addr
}

/// Reads until `count` responses closed by `</tag>` have arrived
async fn read_responses(stream: &mut TcpStream, tag: &str, count: usize) -> String {
    let close = format!("</{}>", tag);
    let mut text = String::new();
    let mut buf = [0u8; 4096];
    while text.matches(&close).count() < count {
        let n = timeout(Duration::from_secs(3), stream.read(&mut buf))
            .await
            .expect("response in time")
            .unwrap();
        assert!(n > 0, "connection closed early: {}", text);
        text.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    text
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_stack_info_and_congestion() {
    let stack = start_stack();
    let addr = start_server(&stack, None).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"<GetStackInfo><RequestId>9</RequestId></GetStackInfo>")
        .await
        .unwrap();
    let info = read_responses(&mut stream, "GetStackInfo", 1).await;
    assert!(info.contains("<RequestId>9</RequestId>"));
    assert!(info.contains("<Result Code=\"200\">Stack info retrieved.</Result>"));
    assert!(info.contains("running=true"));
    assert!(info.contains("UDP"));

    stream
        .write_all(
            b"<SetCongestionTolerance><Request><fifoDescription>state machine</fifoDescription>\
              <metric>SIZE</metric><maxtolerance>50</maxtolerance></Request></SetCongestionTolerance>\
              <GetCongestionStats></GetCongestionStats>",
        )
        .await
        .unwrap();
    let stats = read_responses(&mut stream, "GetCongestionStats", 1).await;
    assert!(stats.contains("<Result Code=\"200\">Congestion Tolerance set.</Result>"));
    assert!(stats.contains("Congestion stats retrieved."));
    assert!(stats.contains("state machine"));
    assert!(stats.contains("SIZE&lt;=50"));
    assert!(stats.contains("NORMAL"));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_rejections_and_handler() {
    let stack = start_stack();
    let addr = start_server(&stack, Some(Arc::new(Dialer) as Arc<dyn CommandHandler>)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(b"<Restart></Restart>").await.unwrap();
    let unknown = read_responses(&mut stream, "Restart", 1).await;
    assert!(unknown.contains("<Result Code=\"400\">Unknown method</Result>"));
    assert!(unknown.contains("<RequestId>1</RequestId>"));

    stream
        .write_all(
            b"<SetCongestionTolerance><fifoDescription>state machine</fifoDescription>\
              <metric>LOUDNESS</metric><maxtolerance>5</maxtolerance></SetCongestionTolerance>",
        )
        .await
        .unwrap();
    let bad = read_responses(&mut stream, "SetCongestionTolerance", 1).await;
    assert!(bad.contains("Code=\"400\">Invalid metric specified"));
    assert!(bad.contains("<RequestId>2</RequestId>"));

    stream
        .write_all(b"<ClickToCall><initiator>sip:alice@example.com</initiator></ClickToCall>")
        .await
        .unwrap();
    let call = read_responses(&mut stream, "ClickToCall", 1).await;
    assert!(call.contains("Code=\"200\">Click to call initiated."));
    assert!(call.contains("sip:alice@example.com"));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_click_to_call_without_handler() {
    let stack = start_stack();
    let addr = start_server(&stack, None).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(b"<InitialSync></InitialSync>").await.unwrap();
    let text = read_responses(&mut stream, "InitialSync", 1).await;
    assert!(text.contains("Code=\"400\">No handler registered for InitialSync."));
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_shutdown_command_stops_stack_and_server() {
    let stack = start_stack();
    let server = CommandServer::bind("127.0.0.1:0", stack.handle()).await.unwrap();
    let addr = server.local_addr().unwrap();
    let cancel = server.cancel_token();
    let serving = tokio::spawn(server.serve());

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"<Shutdown></Shutdown>").await.unwrap();
    let text = read_responses(&mut stream, "Shutdown", 1).await;
    assert!(text.contains("<Result Code=\"200\">Shutdown initiated.</Result>"));

    timeout(Duration::from_secs(3), cancel.cancelled())
        .await
        .expect("server cancelled");
    timeout(Duration::from_secs(3), serving)
        .await
        .expect("server stopped")
        .unwrap()
        .unwrap();

    let handle = stack.handle();
    tokio::task::spawn_blocking(move || stack.join()).await.unwrap();
    assert!(!handle.is_running());
}
