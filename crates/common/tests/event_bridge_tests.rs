//! Event bridge integration tests
//!
//! Run with: `cargo test -p common --test event_bridge_tests`

use common::create_event_bridge;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
enum TopologyEvent {
    Arrived(u8, Vec<u8>),
    Left(u8, Vec<u8>),
}

#[test]
fn test_publish_without_consumer_does_not_block() {
    let (sink, bridge) = create_event_bridge(2);

    assert!(sink.publish(TopologyEvent::Arrived(1, vec![1])));
    assert!(sink.publish(TopologyEvent::Arrived(1, vec![2])));
    // Full: dropped instead of blocking the USB thread
    assert!(!sink.publish(TopologyEvent::Arrived(1, vec![3])));

    assert_eq!(bridge.len(), 2);
}

#[test]
fn test_publish_after_consumer_dropped() {
    let (sink, bridge) = create_event_bridge::<TopologyEvent>(2);
    drop(bridge);

    assert!(!sink.publish(TopologyEvent::Left(1, vec![1])));
    assert!(sink.publish_blocking(TopologyEvent::Left(1, vec![1])).is_err());
}

#[test]
fn test_try_recv_preserves_order() {
    let (sink, bridge) = create_event_bridge(8);

    sink.publish(TopologyEvent::Arrived(1, vec![1]));
    sink.publish(TopologyEvent::Arrived(1, vec![1, 2]));
    sink.publish(TopologyEvent::Left(1, vec![1, 2]));

    assert_eq!(bridge.try_recv(), Some(TopologyEvent::Arrived(1, vec![1])));
    assert_eq!(bridge.try_recv(), Some(TopologyEvent::Arrived(1, vec![1, 2])));
    assert_eq!(bridge.try_recv(), Some(TopologyEvent::Left(1, vec![1, 2])));
    assert!(bridge.is_empty());
}

#[tokio::test]
async fn test_events_cross_threads_in_order() {
    let (sink, bridge) = create_event_bridge(16);

    let producer = thread::spawn(move || {
        for port in 1..=5u8 {
            sink.publish_blocking(TopologyEvent::Arrived(1, vec![port]))
                .unwrap();
            thread::sleep(Duration::from_millis(1));
        }
    });

    for port in 1..=5u8 {
        let event = bridge.recv().await.unwrap();
        assert_eq!(event, TopologyEvent::Arrived(1, vec![port]));
    }

    producer.join().unwrap();
}

#[tokio::test]
async fn test_recv_fails_once_all_sinks_dropped() {
    let (sink, bridge) = create_event_bridge::<TopologyEvent>(4);
    let clone = sink.clone();
    drop(sink);
    clone.publish(TopologyEvent::Left(2, vec![4]));
    drop(clone);

    assert_eq!(bridge.recv().await.unwrap(), TopologyEvent::Left(2, vec![4]));
    assert!(bridge.recv().await.is_err());
}
