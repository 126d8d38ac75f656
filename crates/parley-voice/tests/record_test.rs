mod common;

use common::{fast_config, loopback_channel, opus_packet, silence_packet};
use parley_types::UserId;
use parley_voice::{
    connect_to_channel, record_to_file, ConnectionRegistry, RecordOptions, RecordingConfig,
    VoiceToolkit,
};
use std::io::Cursor;
use std::time::Duration;

#[tokio::test]
async fn test_record_until_silence() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out.ogg");
    let (channel, adapter) = loopback_channel("g1", "c1");
    let registry = ConnectionRegistry::new();
    let connection = connect_to_channel(&channel, &registry, Duration::from_secs(1))
        .await
        .unwrap();
    let user = UserId::from("user123");

    let recording = record_to_file(
        &connection.receiver().unwrap(),
        &user,
        &out,
        RecordOptions {
            silence_timeout: Duration::from_millis(500),
        },
        &RecordingConfig::default(),
    );

    let link = adapter.last_link().unwrap();
    for marker in 0..5 {
        link.speak(&user, opus_packet(marker));
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Stop talking for longer than the silence timeout.
    tokio::time::sleep(Duration::from_millis(600)).await;
    // Spoken after the recording ended, must not be written.
    link.speak(&user, opus_packet(99));

    let path = recording.await.expect("recording should complete");
    assert_eq!(path, out);

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[..4], b"OggS");
    // First page: 27-byte header plus one lacing value, then OpusHead.
    assert_eq!(&bytes[28..36], b"OpusHead");

    let mut reader = ogg::PacketReader::new(Cursor::new(bytes));
    let mut audio = Vec::new();
    while let Some(packet) = reader.read_packet().unwrap() {
        if !packet.data.starts_with(b"Opus") {
            audio.push(packet);
        }
    }
    assert_eq!(audio.len(), 5);
    assert!(audio.last().unwrap().last_in_stream());
    assert_eq!(audio.last().unwrap().absgp_page(), 5 * 960);
}

#[tokio::test]
async fn test_record_cancel_removes_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("partial.ogg");
    let (channel, adapter) = loopback_channel("g1", "c1");
    let registry = ConnectionRegistry::new();
    let connection = connect_to_channel(&channel, &registry, Duration::from_secs(1))
        .await
        .unwrap();
    let user = UserId::from("user123");

    let recording = record_to_file(
        &connection.receiver().unwrap(),
        &user,
        &out,
        RecordOptions::default(),
        &RecordingConfig::default(),
    );
    adapter.last_link().unwrap().speak(&user, opus_packet(1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(out.exists());

    recording.cancel();
    assert!(matches!(
        recording.await,
        Err(parley_voice::VoiceError::Cancelled)
    ));

    // The blocking writer notices the closed queue and cleans up.
    let mut removed = false;
    for _ in 0..50 {
        if !out.exists() {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(removed, "partial recording was left behind");
}

#[tokio::test]
async fn test_toolkit_records_with_configured_silence() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("toolkit.ogg");
    let mut config = fast_config();
    config.silence_timeout_ms = 100;
    let toolkit = VoiceToolkit::new(config).unwrap();
    let (channel, adapter) = loopback_channel("g1", "c1");
    let connection = toolkit.connect(&channel).await.unwrap();
    let user = UserId::from("user123");

    let recording = toolkit.record_to_file(&connection.receiver().unwrap(), &user, &out, None);
    adapter.last_link().unwrap().speak(&user, opus_packet(1));

    let path = tokio::time::timeout(Duration::from_secs(5), recording)
        .await
        .expect("silence should end the recording")
        .unwrap();
    assert_eq!(path, out);
}

#[tokio::test]
async fn test_record_ends_through_silence_frames() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("quiet.ogg");
    let (channel, adapter) = loopback_channel("g1", "c1");
    let registry = ConnectionRegistry::new();
    let connection = connect_to_channel(&channel, &registry, Duration::from_secs(1))
        .await
        .unwrap();
    let user = UserId::from("user123");

    let recording = record_to_file(
        &connection.receiver().unwrap(),
        &user,
        &out,
        RecordOptions {
            silence_timeout: Duration::from_millis(200),
        },
        &RecordingConfig::default(),
    );

    let link = adapter.last_link().unwrap();
    link.speak(&user, opus_packet(1));
    // The transport keeps sending silence frames while the user is quiet.
    let talker = {
        let link = link.clone();
        let user = user.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                link.speak(&user, silence_packet());
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
    };

    let path = tokio::time::timeout(Duration::from_millis(700), recording)
        .await
        .expect("silence frames must not keep the recording open")
        .unwrap();
    talker.abort();

    let mut reader = ogg::PacketReader::new(Cursor::new(std::fs::read(&path).unwrap()));
    let mut audio = Vec::new();
    while let Some(packet) = reader.read_packet().unwrap() {
        if !packet.data.starts_with(b"Opus") {
            audio.push(packet.data);
        }
    }
    assert_eq!(audio, vec![opus_packet(1).to_vec()]);
}
