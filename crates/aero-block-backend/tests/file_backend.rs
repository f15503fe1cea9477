//! Backend over a real file through `FileStore`.

#![cfg(unix)]

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aero_block_backend::{BackendConfig, BlockBackend, BlockIoError, BlockRequest};
use aero_block_store::OpenOptions;

use common::{capture, recv_completion};

#[test]
fn file_backed_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    std::fs::write(&path, vec![0u8; 1 << 20]).unwrap();

    let backend =
        BlockBackend::open_path(&path, &OpenOptions::default(), BackendConfig::default()).unwrap();
    assert_eq!(backend.size(), 1 << 20);
    assert!(!backend.is_read_only());
    assert!(backend.sector_size().is_power_of_two());

    let (on_write, rx) = capture();
    backend
        .write(BlockRequest::transfer(
            8192,
            vec![vec![0xA5; 512], vec![0x5A; 1024]],
            on_write,
        ))
        .unwrap();
    recv_completion(&rx).1.unwrap();

    let (on_flush, rx) = capture();
    backend.flush(BlockRequest::flush(on_flush)).unwrap();
    recv_completion(&rx).1.unwrap();

    let (on_read, rx) = capture();
    backend
        .read(BlockRequest::transfer(8192, vec![vec![0u8; 1536]], on_read))
        .unwrap();
    let (request, result) = recv_completion(&rx);
    result.unwrap();
    assert_eq!(request.residual, 0);
    assert!(request.segments[0][..512].iter().all(|&b| b == 0xA5));
    assert!(request.segments[0][512..].iter().all(|&b| b == 0x5A));

    backend.close();
}

#[test]
fn refresh_size_reports_growth_through_the_callback() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    std::fs::write(&path, vec![0u8; 1 << 20]).unwrap();

    let backend =
        BlockBackend::open_path(&path, &OpenOptions::default(), BackendConfig::default()).unwrap();

    let observed = Arc::new(AtomicU64::new(0));
    {
        let observed = Arc::clone(&observed);
        backend
            .register_resize_callback(move |new_size| {
                observed.store(new_size, Ordering::SeqCst);
            })
            .unwrap();
    }

    // Unchanged size: no callback.
    assert_eq!(backend.refresh_size().unwrap(), None);
    assert_eq!(observed.load(Ordering::SeqCst), 0);

    // Grow the image underneath the backend.
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(2 << 20).unwrap();

    assert_eq!(backend.refresh_size().unwrap(), Some(2 << 20));
    assert_eq!(backend.size(), 2 << 20);
    assert_eq!(observed.load(Ordering::SeqCst), 2 << 20);

    backend.close();
}

#[test]
fn read_only_open_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");
    std::fs::write(&path, vec![0x11; 1 << 16]).unwrap();

    let options = OpenOptions {
        read_only: true,
        ..OpenOptions::default()
    };
    let backend = BlockBackend::open_path(&path, &options, BackendConfig::default()).unwrap();
    assert!(backend.is_read_only());
    assert!(!backend.can_discard());

    let (on_write, rx) = capture();
    backend
        .write(BlockRequest::transfer(0, vec![vec![0u8; 512]], on_write))
        .unwrap();
    let (_, result) = recv_completion(&rx);
    assert!(matches!(result, Err(BlockIoError::ReadOnly)));

    let (on_read, rx) = capture();
    backend
        .read(BlockRequest::transfer(0, vec![vec![0u8; 512]], on_read))
        .unwrap();
    let (request, result) = recv_completion(&rx);
    result.unwrap();
    assert!(request.segments[0].iter().all(|&b| b == 0x11));

    backend.close();
}
