//! 进程内场景测试
//!
//! 客户端、调度器和监视器在同一进程的不同线程中运行，共享一个本地段。

use chunkipc_core::monitor::{InProcessResolver, PeerLiveness};
use chunkipc_core::{
    Client, Delivery, Monitor, MonitorConfig, MonitorLink, OwnerId, Scheduler, Segment, SegmentConfig,
    CHUNK_SIZE, LINK_TERMINATOR,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn segment(name: &str, config: SegmentConfig) -> Arc<Segment> {
    Arc::new(Segment::create_local(name, config).unwrap())
}

fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    f()
}

/// 请求-响应往返：通道 3，块 10，引用计数归零
#[test]
fn test_request_response_round_trip() {
    let segment = segment(
        "chunkipc_ROUND_1",
        SegmentConfig::new().chunks(64).schedulers(1).channels(8).clients(2),
    );
    let client = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
    let mut scheduler = Scheduler::attach(Arc::clone(&segment), 0).unwrap();

    // Free channels and chunks come out in index order
    for expected in 0..4 {
        assert_eq!(client.acquire_channel(0).unwrap(), expected);
    }
    let filler = client.acquire_linked_counted(10, Duration::ZERO).unwrap();
    let head = client.acquire_linked(100, Duration::ZERO).unwrap();
    assert_eq!(head, 10);
    client.write_message(head, b"SELECT 1").unwrap();
    client.push(3, head, Duration::from_millis(100)).unwrap();

    let request = scheduler.poll().unwrap().unwrap();
    assert_eq!(request.channel, 3);
    assert_eq!(request.head, 10);
    assert_eq!(segment.channel(3).unwrap().server_refs(), 1);
    assert_eq!(client.read_message(request.head).unwrap(), b"SELECT 1");

    // The request chain is reused as the response
    client.write_message(request.head, b"1").unwrap();
    assert_eq!(scheduler.respond(3, request.head).unwrap(), Delivery::Delivered);
    assert_eq!(scheduler.release_reference(3).unwrap(), 0);

    let response = client.pop(3, Duration::from_millis(100)).unwrap();
    assert_eq!(response, 10);
    assert_eq!(client.read_message(response).unwrap(), b"1");
    assert_eq!(segment.channel(3).unwrap().server_refs(), 0);

    client.release_linked(response).unwrap();
    client.release_linked(filler).unwrap();
    drop(scheduler);
    drop(client);
    assert_eq!(segment.shared_pool().len(), 64);
}

/// 响应环满后进入溢出队列，顺序保持不变
#[test]
fn test_overflow_preserves_order() {
    let segment = segment(
        "chunkipc_OVERFLOW_1",
        SegmentConfig::new().chunks(512).schedulers(1).channels(4).clients(2),
    );
    let client = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
    let mut scheduler = Scheduler::attach(Arc::clone(&segment), 0).unwrap();
    let channel = client.acquire_channel(0).unwrap();

    let mut sent = Vec::new();
    {
        let pool = scheduler.private_pool().unwrap();
        for i in 0..256u32 {
            let head = pool.acquire_linked_counted(1, Duration::ZERO).unwrap();
            client.write_message(head, &i.to_le_bytes()).unwrap();
            let delivery = scheduler.respond(channel, head).unwrap();
            if i < 255 {
                assert_eq!(delivery, Delivery::Delivered);
            } else {
                assert_eq!(delivery, Delivery::Overflowed);
            }
            sent.push(head);
        }
    }
    assert_eq!(segment.channel(channel).unwrap().overflow_len(), 1);

    let first = client.try_pop(channel).unwrap().unwrap();
    assert_eq!(first, sent[0]);
    // The freed slot is filled on the scheduler's next scan
    assert_eq!(scheduler.poll().unwrap(), None);
    assert_eq!(segment.channel(channel).unwrap().overflow_len(), 0);

    let mut received = vec![first];
    while let Some(head) = client.try_pop(channel).unwrap() {
        received.push(head);
    }
    assert_eq!(received, sent);
    let values: Vec<u32> = received
        .iter()
        .map(|&h| {
            let bytes = client.read_message(h).unwrap();
            u32::from_le_bytes(bytes.try_into().unwrap())
        })
        .collect();
    assert_eq!(values, (0..256).collect::<Vec<_>>());

    for head in received {
        client.release_linked(head).unwrap();
    }
}

/// 释放空链是无操作；通道重复释放请求不会出错
#[test]
fn test_release_is_idempotent() {
    let segment = segment(
        "chunkipc_IDEM_1",
        SegmentConfig::new().chunks(64).schedulers(1).channels(4).clients(2),
    );
    let client = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
    assert_eq!(client.release_linked(LINK_TERMINATOR).unwrap(), 0);
    assert_eq!(segment.shared_pool().len(), 64);

    let mut scheduler = Scheduler::attach(Arc::clone(&segment), 0).unwrap();
    let channel = client.acquire_channel(0).unwrap();
    client.release_channel(channel).unwrap();
    client.release_channel(channel).unwrap();
    assert_eq!(scheduler.poll().unwrap(), None);
    assert!(!client.owns_channel(channel));
    assert_eq!(client.allocated_channels(), 0);
    assert!(client.release_channel(channel).is_err());
    assert_eq!(segment.scheduler_interface(0).unwrap().free_channel_count(), 4);
}

/// 大消息跨越多个块
#[test]
fn test_multi_chunk_message() {
    let segment = segment(
        "chunkipc_LARGE_1",
        SegmentConfig::new().chunks(64).schedulers(1).channels(4).clients(2),
    );
    let client = Client::open(Arc::clone(&segment), OwnerId::new(5)).unwrap();
    let payload: Vec<u8> = (0..3 * CHUNK_SIZE).map(|i| (i % 251) as u8).collect();
    let head = client.acquire_linked(payload.len(), Duration::ZERO).unwrap();
    client.write_message(head, &payload).unwrap();
    assert_eq!(client.read_message(head).unwrap(), payload);
    let released = client.release_linked(head).unwrap();
    assert!(released >= 4);
    assert_eq!(segment.shared_pool().len(), 64);
}

#[derive(Default)]
struct FakeLiveness {
    dead: Mutex<HashSet<u32>>,
}

impl PeerLiveness for FakeLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        !self.dead.lock().contains(&pid)
    }
}

/// 客户端持有通道 {3, 7, 12} 时消失，监视器回收全部资源
#[test]
fn test_vanished_client_is_reclaimed() {
    let segment = segment(
        "chunkipc_VANISH_1",
        SegmentConfig::new().chunks(128).schedulers(1).channels(16).clients(4),
    );
    let mut config = MonitorConfig::new("scenario-vanish");
    config.data_dir = std::env::temp_dir();
    config.poll_interval = Duration::from_millis(5);
    config.registrar_tick = Duration::from_millis(5);
    let link = Arc::new(MonitorLink::create_local(&config.interface_name()));
    let liveness = Arc::new(FakeLiveness::default());
    let resolver = Arc::new(InProcessResolver::new());
    resolver.insert(Arc::clone(&segment));
    let monitor = Monitor::start_with(config, Arc::clone(&link), liveness.clone(), resolver).unwrap();

    let db = link
        .register_database(7000, segment.name(), link.registration_timeout())
        .unwrap();
    segment.set_database_owner(db, 7000);

    // 调度器线程
    let stop = Arc::new(AtomicBool::new(false));
    let worker = {
        let segment = Arc::clone(&segment);
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("scheduler-0".to_string())
            .spawn(move || {
                let mut scheduler = Scheduler::attach(segment, 0).unwrap();
                while !stop.load(Ordering::Acquire) {
                    if let Some(request) = scheduler.poll().unwrap() {
                        scheduler.release_request(request.channel, request.head).unwrap();
                        scheduler.release_reference(request.channel).unwrap();
                    }
                    let _ = scheduler.wait_for_work(Duration::from_millis(5));
                }
            })
            .unwrap()
    };
    assert!(wait_until(Duration::from_secs(2), || segment.common().active_schedulers() == 1));

    let owner = link.register_client(7001, link.registration_timeout()).unwrap();
    let client = Client::open(Arc::clone(&segment), owner).unwrap();
    let channels: Vec<u32> = (0..13).map(|_| client.acquire_channel(0).unwrap()).collect();
    for &channel in &channels {
        if ![3, 7, 12].contains(&channel) {
            client.release_channel(channel).unwrap();
        }
    }
    assert!(wait_until(Duration::from_secs(2), || client.allocated_channels() == 3));
    let held: Vec<u32> = client.resource_map().unwrap().owned_channels().collect();
    assert_eq!(held, vec![3, 7, 12]);
    client.acquire_linked_counted(4, Duration::ZERO).unwrap();
    let number = client.number();

    // 进程崩溃：既不关闭也不注销
    std::mem::forget(client);
    liveness.dead.lock().insert(7001);

    assert!(wait_until(Duration::from_secs(5), || {
        segment.client_interface(number).unwrap().owner().is_none()
            && segment.common().client_interfaces_to_clean_up() == 0
    }));
    for channel in [3, 7, 12] {
        assert!(segment.channel(channel).unwrap().owner().is_none());
    }
    assert!(segment.resource_map(number).unwrap().is_empty());
    assert_eq!(segment.scheduler_interface(0).unwrap().free_channel_count(), 16);
    assert!(wait_until(Duration::from_secs(2), || segment.shared_pool().len() == 128));
    assert_eq!(monitor.processes().len(), 1);

    stop.store(true, Ordering::Release);
    worker.join().unwrap();
    monitor.stop();
}
