//! Producer/consumer exchange through separate mappings of the same file,
//! the shape the service relies on across processes.

use m1_memshare::params::ids;
use m1_memshare::{
    AudioFormat, MemShareError, ParameterMap, Segment, SegmentName, WriteOptions,
};
use tempfile::TempDir;

fn audio_block(channels: usize, samples: usize) -> Vec<Vec<f32>> {
    (0..channels)
        .map(|ch| {
            (0..samples)
                .map(|i| (ch as f32 + 1.0) * (i as f32 / samples as f32))
                .collect()
        })
        .collect()
}

#[test]
fn test_basic_producer_consumer_exchange() {
    let dir = TempDir::new().unwrap();
    let name = SegmentName::new("M1Panner", std::process::id(), 0x10, 1);
    let path = dir.path().join(name.file_name());

    // Producer side.
    let producer = Segment::create(&path, &name.stem(), 1024 * 1024, 8).unwrap();
    producer.init_audio_format(AudioFormat {
        sample_rate: 48000,
        num_channels: 2,
        samples_per_block: 512,
    });

    // Consumer side: a second, independent mapping of the same file.
    let consumer = Segment::attach(&path, 8).unwrap();
    assert_eq!(consumer.audio_format().sample_rate, 48000);
    consumer.register_consumer(9001).unwrap();

    // Registration is visible to the producer before the next write.
    assert_eq!(producer.consumer_count(), 1);

    let audio = audio_block(2, 512);
    let mut params = ParameterMap::new();
    params.set_f32(ids::AZIMUTH, 0.5);
    params.set_f32(ids::ELEVATION, -0.25);
    let opts = WriteOptions {
        requires_ack: true,
        is_playing: true,
        ..Default::default()
    };
    let id = producer.write_buffer(&audio, &params, &opts).unwrap();

    assert_eq!(producer.unconsumed_buffer_count(), 1);
    assert_eq!(consumer.unconsumed_buffer_count(), 1);

    let read = consumer.read_oldest_unacked(9001).unwrap();
    assert_eq!(read.buffer_id, id);
    assert_eq!(read.audio, audio);
    assert_eq!(read.params.get_f32(ids::AZIMUTH, 0.0), 0.5);
    assert_eq!(read.params.get_f32(ids::ELEVATION, 0.0), -0.25);
    assert!(read.is_playing);

    consumer.acknowledge(id, 9001).unwrap();
    producer.cleanup();
    assert_eq!(producer.unconsumed_buffer_count(), 0);
}

#[test]
fn test_two_consumers_with_one_lagging() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lagging.mem");

    let producer = Segment::create(&path, "lagging", 1024 * 1024, 8).unwrap();
    let fast = Segment::attach(&path, 8).unwrap();
    let slow = Segment::attach(&path, 8).unwrap();
    fast.register_consumer(9001).unwrap();
    slow.register_consumer(9002).unwrap();

    let params = ParameterMap::new();
    let opts = WriteOptions {
        requires_ack: true,
        ..Default::default()
    };
    let ids: Vec<u64> = (0..8)
        .map(|_| producer.write_buffer(&audio_block(1, 64), &params, &opts).unwrap())
        .collect();

    // The fast consumer drains everything in order.
    for expected in &ids {
        let read = fast.read_oldest_unacked(9001).unwrap();
        assert_eq!(read.buffer_id, *expected);
        fast.acknowledge(read.buffer_id, 9001).unwrap();
    }

    // The head still awaits the slow consumer: the queue is full and stays
    // untouched by a new required write.
    assert!(matches!(
        producer.write_buffer(&audio_block(1, 64), &params, &opts),
        Err(MemShareError::QueueFull)
    ));
    assert_eq!(producer.unconsumed_buffer_count(), 8);

    // Slow consumer acknowledges the head, which unblocks the producer.
    let head = slow.read_oldest_unacked(9002).unwrap();
    assert_eq!(head.buffer_id, ids[0]);
    slow.acknowledge(head.buffer_id, 9002).unwrap();

    let next = producer.write_buffer(&audio_block(1, 64), &params, &opts).unwrap();
    assert_eq!(next, 9);

    // The slow consumer continues in sequence order with nothing skipped.
    let read = slow.read_oldest_unacked(9002).unwrap();
    assert_eq!(read.buffer_id, ids[1]);
}

#[test]
fn test_available_ids_and_read_by_id_across_mappings() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("byid.mem");

    let producer = Segment::create(&path, "byid", 1024 * 1024, 8).unwrap();
    let consumer = Segment::attach(&path, 8).unwrap();
    consumer.register_consumer(7).unwrap();

    let params = ParameterMap::new();
    let opts = WriteOptions {
        requires_ack: true,
        ..Default::default()
    };
    let a = producer.write_buffer(&audio_block(1, 16), &params, &opts).unwrap();
    let b = producer.write_buffer(&audio_block(1, 16), &params, &opts).unwrap();

    assert_eq!(consumer.available_buffer_ids(), vec![a, b]);
    let read = consumer.read_by_id(b).unwrap();
    assert_eq!(read.buffer_id, b);
    assert!(matches!(
        consumer.read_by_id(999),
        Err(MemShareError::NoData)
    ));
}
