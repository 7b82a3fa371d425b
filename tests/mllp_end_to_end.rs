use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use hl7_processor::ack::{parse_ack, AckCode};
use hl7_processor::client::{ClientConfig, MllpClient};
use hl7_processor::pipeline::MessageProcessor;
use hl7_processor::server::{MllpServer, ServerConfig, ServerEvent};
use hl7_processor::store::{InMemoryQueue, InMemoryRepository, MessageQuery, MessageRepository};
use hl7_processor::MllpCodec;

const ADT: &str = "MSH|^~\\&|SND|SND|RCV|RCV|20230101120000||ADT^A01|MSG0001|P|2.5\rPID|1||12345||DOE^JOHN\r";

async fn bind_local() -> MllpServer {
    MllpServer::bind(ServerConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        ..ServerConfig::default()
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn message_is_announced_and_acknowledged() {
    let server = bind_local().await;
    let address = server.local_addr().unwrap();
    let mut events = server.subscribe();
    let handle = server.spawn();

    let stream = TcpStream::connect(address).await.unwrap();
    let mut transport = Framed::new(stream, MllpCodec::new());
    transport.send(BytesMut::from(ADT)).await.unwrap();

    let response = tokio::time::timeout(Duration::from_secs(5), transport.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let ack = parse_ack(&response).unwrap();
    assert_eq!(ack.code, AckCode::ApplicationAccept);
    assert_eq!(ack.raw_code, "AA");
    assert_eq!(ack.acknowledged_control_id, "MSG0001");

    let received = loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap() {
            ServerEvent::MessageReceived { message, .. } => break message,
            _ => continue,
        }
    };
    assert_eq!(received, ADT);

    drop(transport);
    handle.stop().await.unwrap();
}

#[tokio::test]
async fn client_batch_is_processed_and_stored() {
    let server = bind_local().await;
    let port = server.local_addr().unwrap().port();
    let events = server.subscribe();
    let handle = server.spawn();

    let repository = Arc::new(InMemoryRepository::new());
    let queue = Arc::new(InMemoryQueue::new());
    let processor = MessageProcessor::new(repository.clone(), queue.clone());
    let stop_processing = CancellationToken::new();
    let consumer = tokio::spawn({
        let stop = stop_processing.clone();
        async move { processor.consume(events, stop).await }
    });

    let client = MllpClient::new(ClientConfig {
        port,
        ack_timeout_ms: 5_000,
        continue_on_error: true,
        ..ClientConfig::default()
    });
    let messages = vec![
        ADT.to_string(),
        ADT.replace("MSG0001", "MSG0002").replace("ADT^A01", "ORU^R01"),
        "PID|1||no header".to_string(),
    ];
    let results = client.send_batch(&messages).await;
    client.disconnect().await;

    assert_eq!(results.len(), 3);
    assert!(results[0].success && results[1].success);
    assert!(!results[2].success);
    assert_eq!(results[2].ack.as_ref().unwrap().code, AckCode::ApplicationReject);

    // processing runs behind the acknowledgments
    let mut stored = 0;
    for _ in 0..50 {
        stored = repository.len().await;
        if stored == 2 && queue.dead_letter_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stored, 2);
    assert_eq!(queue.dead_letter_count().await, 1);

    let page = repository.query(&MessageQuery::default()).await.unwrap();
    let mut ids: Vec<String> = page.items.into_iter().map(|m| m.id).collect();
    ids.sort();
    assert_eq!(ids, vec!["MSG0001", "MSG0002"]);

    stop_processing.cancel();
    consumer.await.unwrap();
    handle.stop().await.unwrap();
}
