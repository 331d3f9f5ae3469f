mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::PAGE;
use pagelog::backing::Backing;
use pagelog::{MappedPage, PageSequencer, Position, SequencerOptions};
use proptest::prelude::*;

fn sequencer(prewarm: bool) -> (tempfile::TempDir, PageSequencer) {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let options = SequencerOptions {
        grow_pages: 4,
        prewarm,
        populate: false,
    };
    let seq = PageSequencer::open(dir.path().join("seq"), PAGE, options).unwrap();
    (dir, seq)
}

#[test]
fn test_exact_fit_does_not_rotate() {
    let (_dir, seq) = sequencer(false);
    seq.append(&vec![1u8; (PAGE - 100) as usize]).unwrap();
    assert_eq!(seq.append(&[2u8; 100]).unwrap(), PAGE - 100);
    assert_eq!(seq.position(), Position { page: 0, offset: PAGE });
    assert_eq!(seq.free_space(), 0);

    assert_eq!(seq.append(&[3u8]).unwrap(), PAGE, "one more byte rotates once");
    assert_eq!(seq.position(), Position { page: 1, offset: 1 });
}

#[test]
fn test_backing_grows_in_whole_steps() {
    let (dir, seq) = sequencer(false);
    for _ in 0..5 {
        seq.append(&vec![0u8; PAGE as usize]).unwrap();
    }
    let len = std::fs::metadata(dir.path().join("seq")).unwrap().len();
    assert_eq!(len, 8 * PAGE, "grown twice by four pages, never shrunk");
}

#[test]
fn test_bytes_land_at_returned_positions() {
    let (dir, seq) = sequencer(true);
    let mut written = Vec::new();
    for i in 0..200u32 {
        let payload = vec![(i % 251) as u8 + 1; 1000 + i as usize];
        let at = seq.append(&payload).unwrap();
        written.push((at, payload));
    }
    seq.flush().unwrap();

    let data = std::fs::read(dir.path().join("seq")).unwrap();
    for (at, payload) in written {
        let at = at as usize;
        assert_eq!(&data[at..at + payload.len()], &payload[..]);
        assert!(at as u64 % PAGE + payload.len() as u64 <= PAGE, "no run straddles a page");
    }
}

#[test]
fn test_sealed_page_keeps_its_offset() {
    let dir = tempfile::tempdir().unwrap();
    let backing = Backing::create(dir.path().join("page"), PAGE, 1).unwrap();
    let page = Arc::new(MappedPage::activate(&backing, 0, false).unwrap());
    let barrier = Arc::new(Barrier::new(5));

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let page = Arc::clone(&page);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut granted = 0u64;
                while page.write(&[7u8; 16]).is_some() {
                    granted += 16;
                }
                granted
            })
        })
        .collect();
    barrier.wait();
    page.seal();
    let granted: u64 = writers.into_iter().map(|w| w.join().unwrap()).sum();

    assert!(page.is_sealed());
    assert_eq!(page.used(), granted);
    assert_eq!(page.write(b"late"), None);
}

#[test]
fn test_concurrent_appends_across_rotations() {
    let (_dir, seq) = sequencer(true);
    let seq = Arc::new(seq);
    const LEN: usize = 3000;

    let threads: Vec<_> = (0..8u8)
        .map(|t| {
            let seq = Arc::clone(&seq);
            thread::spawn(move || (0..100).map(|_| seq.append(&[t; LEN]).unwrap()).collect::<Vec<_>>())
        })
        .collect();
    let mut positions: Vec<u64> = threads.into_iter().flat_map(|t| t.join().unwrap()).collect();
    positions.sort_unstable();

    for pair in positions.windows(2) {
        assert!(pair[0] + LEN as u64 <= pair[1], "runs {} and {} overlap", pair[0], pair[1]);
    }
    for at in &positions {
        assert!(at % PAGE + LEN as u64 <= PAGE);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn reservations_never_overlap(threads in 1usize..8, len in 1u64..256, per_thread in 1usize..16) {
        let dir = tempfile::tempdir().unwrap();
        let backing = Backing::create(dir.path().join("page"), PAGE, 1).unwrap();
        let page = Arc::new(MappedPage::activate(&backing, 0, false).unwrap());

        let workers: Vec<_> = (0..threads)
            .map(|_| {
                let page = Arc::clone(&page);
                thread::spawn(move || {
                    (0..per_thread).map(|_| page.reserve(len).unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut offsets: Vec<u64> = workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
        offsets.sort_unstable();

        let total = (threads * per_thread) as u64 * len;
        prop_assert_eq!(page.used(), total);
        let expected: Vec<u64> = (0..(threads * per_thread) as u64).map(|i| i * len).collect();
        prop_assert_eq!(offsets, expected);
    }
}
