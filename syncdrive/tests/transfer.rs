/*
 * SPDX-FileCopyrightText: 2024 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs,
    sync::{
        atomic::AtomicBool,
        Arc, Mutex,
    },
    time::Instant,
};

use syncdrive::transfer::TransferEngine;

fn source_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn chunked_transfer_with_progress() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();
    let src = temp_dir.path().join("src.bin");
    let dst = temp_dir.path().join("dst.bin");

    let data = source_data(10240);
    fs::write(&src, &data).unwrap();

    let progress = Arc::new(Mutex::new(Vec::<f64>::new()));
    let progress_clone = progress.clone();

    let mut engine = TransferEngine::new();
    engine.set_chunk_size(2048);
    engine.on_progress(move |percent| {
        progress_clone.lock().unwrap().push(percent);
    });

    let result = engine.transfer(&src, &dst, &cancel_signal);

    assert!(result.success, "{}", result.error_message);
    assert_eq!(result.bytes_transferred, 10240);
    assert!(result.bytes_per_second > 0.0);
    assert_eq!(fs::read(&dst).unwrap(), data);

    let progress = progress.lock().unwrap();
    assert_eq!(progress.len(), 5);
    assert_eq!(*progress.last().unwrap(), 100.0);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(progress.iter().all(|p| (0.0..=100.0).contains(p)));
}

#[test]
fn resume_completes_partial_transfer() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();
    let src = temp_dir.path().join("src.bin");
    let dst = temp_dir.path().join("dst.bin");

    let data = source_data(10240);
    fs::write(&src, &data).unwrap();
    // Destination already holds the first half.
    fs::write(&dst, &data[..5120]).unwrap();

    let mut engine = TransferEngine::new();
    engine.record_partial(&src, &dst, 5120);

    let result = engine.resume(&src, &dst, &cancel_signal);

    assert!(result.success, "{}", result.error_message);
    assert_eq!(result.bytes_transferred, 10240);
    assert_eq!(fs::read(&dst).unwrap(), data);
}

#[test]
fn resume_record_is_consumed() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();
    let src = temp_dir.path().join("src.bin");
    let dst = temp_dir.path().join("dst.bin");

    let data = source_data(4096);
    fs::write(&src, &data).unwrap();
    fs::write(&dst, &data[..1024]).unwrap();

    let mut engine = TransferEngine::new();
    engine.record_partial(&src, &dst, 1024);

    assert!(engine.resume(&src, &dst, &cancel_signal).success);
    assert_eq!(fs::read(&dst).unwrap(), data);

    // The record was consumed, so a second resume is a fresh full transfer
    // that truncates the destination first.
    assert!(engine.resume(&src, &dst, &cancel_signal).success);
    assert_eq!(fs::read(&dst).unwrap(), data);
}

#[test]
fn resume_without_record_is_fresh_transfer() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();
    let src = temp_dir.path().join("src.bin");
    let dst = temp_dir.path().join("dst.bin");

    let data = source_data(2048);
    fs::write(&src, &data).unwrap();
    fs::write(&dst, b"stale destination contents").unwrap();

    let mut engine = TransferEngine::new();
    let result = engine.resume(&src, &dst, &cancel_signal);

    assert!(result.success);
    assert_eq!(fs::read(&dst).unwrap(), data);
}

#[test]
fn cancelled_transfer_fails() {
    let cancel_signal = AtomicBool::new(true);
    let temp_dir = tempfile::tempdir().unwrap();
    let src = temp_dir.path().join("src.bin");
    let dst = temp_dir.path().join("dst.bin");
    fs::write(&src, b"data").unwrap();

    let mut engine = TransferEngine::new();
    let result = engine.transfer(&src, &dst, &cancel_signal);

    assert!(!result.success);
    assert!(result.error_message.contains("cancelled"));
}

#[test]
fn missing_source_fails_with_message() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();

    let mut engine = TransferEngine::new();
    let result = engine.transfer(
        &temp_dir.path().join("nonexistent"),
        &temp_dir.path().join("dst.bin"),
        &cancel_signal,
    );

    assert!(!result.success);
    assert!(!result.error_message.is_empty());
    assert_eq!(result.bytes_transferred, 0);
}

#[test]
fn unwritable_destination_fails_with_message() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();
    let src = temp_dir.path().join("src.bin");
    fs::write(&src, b"data").unwrap();

    let mut engine = TransferEngine::new();
    let result = engine.transfer(
        &src,
        &temp_dir.path().join("no-such-dir/dst.bin"),
        &cancel_signal,
    );

    assert!(!result.success);
    assert!(!result.error_message.is_empty());
}

#[test]
fn batch_is_best_effort() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();

    let a = temp_dir.path().join("a.bin");
    let b = temp_dir.path().join("b.bin");
    fs::write(&a, b"aaa").unwrap();
    fs::write(&b, b"bbbb").unwrap();

    let pairs = vec![
        (a.clone(), temp_dir.path().join("a.out")),
        (temp_dir.path().join("missing"), temp_dir.path().join("m.out")),
        (b.clone(), temp_dir.path().join("b.out")),
    ];

    let mut engine = TransferEngine::new();
    let results = engine.transfer_batch(&pairs, &cancel_signal);

    assert_eq!(results.len(), 3);
    assert!(results[0].success);
    assert!(!results[1].success);
    assert!(results[2].success);

    // The failure in the middle did not stop the rest.
    assert_eq!(fs::read(temp_dir.path().join("a.out")).unwrap(), b"aaa");
    assert_eq!(fs::read(temp_dir.path().join("b.out")).unwrap(), b"bbbb");
}

#[test]
fn retry_succeeds_on_third_attempt() {
    let mut engine = TransferEngine::new();
    engine.set_max_retries(3);
    engine.set_base_backoff_ms(10);

    let mut attempts = 0u32;
    let start = Instant::now();

    let ok = engine.retry_with_backoff(|| {
        attempts += 1;
        attempts == 3
    });

    let elapsed = start.elapsed();

    assert!(ok);
    assert_eq!(attempts, 3);
    // Sleeps of 10 ms and 20 ms between the three attempts, none after the
    // success.
    assert!(elapsed.as_millis() >= 28, "{elapsed:?}");
    assert!(elapsed.as_millis() < 500, "{elapsed:?}");
}

#[test]
fn retry_gives_up_after_max_attempts() {
    let mut engine = TransferEngine::new();
    engine.set_max_retries(3);
    engine.set_base_backoff_ms(1);

    let mut attempts = 0u32;
    let ok = engine.retry_with_backoff(|| {
        attempts += 1;
        false
    });

    assert!(!ok);
    assert_eq!(attempts, 3);
}

#[test]
fn offset_transfer_appends() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();
    let src = temp_dir.path().join("src.bin");
    let dst = temp_dir.path().join("dst.bin");

    let data = source_data(8192);
    fs::write(&src, &data).unwrap();
    fs::write(&dst, &data[..4096]).unwrap();

    let mut engine = TransferEngine::new();
    engine.set_chunk_size(1000);

    let result = engine.transfer_with_offset(&src, &dst, 4096, &cancel_signal);

    assert!(result.success);
    // Reported bytes include the skipped prefix.
    assert_eq!(result.bytes_transferred, 8192);
    assert_eq!(fs::read(&dst).unwrap(), data);
}

#[test]
fn partial_records_are_per_source() {
    let cancel_signal = AtomicBool::new(false);
    let temp_dir = tempfile::tempdir().unwrap();

    let a = temp_dir.path().join("a.bin");
    let b = temp_dir.path().join("b.bin");
    let data_a = source_data(2048);
    let data_b = source_data(1024);
    fs::write(&a, &data_a).unwrap();
    fs::write(&b, &data_b).unwrap();

    let a_dst = temp_dir.path().join("a.out");
    fs::write(&a_dst, &data_a[..512]).unwrap();

    let mut engine = TransferEngine::new();
    engine.record_partial(&a, &a_dst, 512);

    // Transferring b is unaffected by a's partial record.
    let b_dst = temp_dir.path().join("b.out");
    assert!(engine.transfer(&b, &b_dst, &cancel_signal).success);
    assert_eq!(fs::read(&b_dst).unwrap(), data_b);

    assert!(engine.resume(&a, &a_dst, &cancel_signal).success);
    assert_eq!(fs::read(&a_dst).unwrap(), data_a);
}
