//! Behavioural properties of the first-fit sub-allocator.

use approx::assert_relative_eq;
use lucent_gpu::{AllocError, FreeRange, SubAllocator, Suballocation};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Allocate `sizes` back to back and return the handles.
fn fill(sa: &mut SubAllocator, sizes: &[u64]) -> Vec<Suballocation> {
    sizes
        .iter()
        .map(|&size| sa.allocate(size, 1).expect("fill allocation"))
        .collect()
}

fn assert_conserved(sa: &SubAllocator) {
    let live: u64 = sa.allocations().iter().map(|a| a.size).sum();
    assert_eq!(sa.free_size() + live, sa.capacity());
}

fn assert_no_overlap(sa: &SubAllocator) {
    let allocations = sa.allocations();
    for pair in allocations.windows(2) {
        assert!(
            pair[0].end() <= pair[1].offset,
            "{:?} overlaps {:?}",
            pair[0],
            pair[1]
        );
    }
    for a in &allocations {
        for r in sa.free_ranges() {
            assert!(
                a.end() <= r.offset || r.end() <= a.offset,
                "{a:?} overlaps free range {r:?}"
            );
        }
    }
}

#[test]
fn adjacent_releases_coalesce_in_either_order() {
    for reverse in [false, true] {
        let mut sa = SubAllocator::new(100, 1).unwrap();
        let parts = fill(&mut sa, &[40, 60]);
        let (first, second) = if reverse {
            (parts[1], parts[0])
        } else {
            (parts[0], parts[1])
        };

        sa.release(first.id).unwrap();
        sa.release(second.id).unwrap();

        assert_eq!(
            sa.free_ranges().collect::<Vec<_>>(),
            vec![FreeRange {
                offset: 0,
                size: 100
            }]
        );
        let whole = sa.allocate(100, 1).unwrap();
        assert_eq!(whole.offset, 0);
    }
}

#[test]
fn coalesced_middle_range_serves_combined_size() {
    let mut sa = SubAllocator::new(400, 1).unwrap();
    let parts = fill(&mut sa, &[100, 100, 100, 100]);

    sa.release(parts[2].id).unwrap();
    sa.release(parts[1].id).unwrap();

    let combined = sa.allocate(200, 1).unwrap();
    assert_eq!(combined.offset, 100);
    assert_eq!(sa.free_size(), 0);
}

#[test]
fn first_fit_picks_lowest_adequate_range() {
    // Free ranges of 100, 50 and 200 bytes separated by small live blocks.
    let mut sa = SubAllocator::new(370, 1).unwrap();
    let parts = fill(&mut sa, &[100, 10, 50, 10, 200]);
    for i in [0, 2, 4] {
        sa.release(parts[i].id).unwrap();
    }
    let sizes: Vec<u64> = sa.free_ranges().map(|r| r.size).collect();
    assert_eq!(sizes, vec![100, 50, 200]);

    let a = sa.allocate(60, 1).unwrap();
    assert_eq!(a.offset, 0);

    // 40 left at the front, so 45 skips it and the 50 range.
    let b = sa.allocate(45, 1).unwrap();
    assert_eq!(b.offset, 110);
}

#[test]
fn alignment_256_yields_aligned_offsets() {
    let mut sa = SubAllocator::new(64 * 1024, 1).unwrap();
    sa.allocate(3, 1).unwrap();

    for size in [1, 100, 255, 256, 257, 1000] {
        let a = sa.allocate(size, 256).unwrap();
        assert_eq!(a.offset % 256, 0, "offset {} for size {size}", a.offset);
    }
    assert_conserved(&sa);
    assert!(sa.validate().is_ok());
}

#[test]
fn leading_padding_is_recovered_as_free_range() {
    let mut sa = SubAllocator::new(1024, 1).unwrap();
    sa.allocate(3, 1).unwrap();
    let aligned = sa.allocate(10, 256).unwrap();

    assert_eq!(aligned.offset, 256);
    let ranges: Vec<_> = sa.free_ranges().collect();
    assert_eq!(
        ranges,
        vec![
            FreeRange {
                offset: 3,
                size: 253
            },
            FreeRange {
                offset: 266,
                size: 758
            },
        ]
    );

    // The padding fragment is usable by later requests.
    let small = sa.allocate(200, 1).unwrap();
    assert_eq!(small.offset, 3);
}

#[test]
fn fragmentation_metric() {
    let mut sa = SubAllocator::new(40, 1).unwrap();
    let parts = fill(&mut sa, &[10, 5, 10, 5, 10]);
    for i in [0, 2, 4] {
        sa.release(parts[i].id).unwrap();
    }
    let sizes: Vec<u64> = sa.free_ranges().map(|r| r.size).collect();
    assert_eq!(sizes, vec![10, 10, 10]);
    assert_eq!(sa.free_size(), 30);
    assert_relative_eq!(sa.fragmentation_percent(), 200.0 / 3.0, epsilon = 1e-9);

    let single = SubAllocator::new(30, 1).unwrap();
    assert_eq!(single.fragmentation_percent(), 0.0);
}

#[test]
fn fragmented_space_fails_where_raw_total_would_not() {
    let mut sa = SubAllocator::new(1000, 1).unwrap();
    let parts = fill(&mut sa, &[25, 475, 25, 475]);
    sa.release(parts[0].id).unwrap();
    sa.release(parts[2].id).unwrap();
    assert_eq!(sa.allocated_size(), 950);
    assert_eq!(sa.free_size(), 50);

    let err = sa.allocate(60, 1).unwrap_err();
    assert_eq!(
        err,
        AllocError::OutOfSpace {
            size: 60,
            alignment: 1,
            free_size: 50,
            largest_free: 25,
        }
    );
    // Even the raw free total does not fit as one block.
    assert!(matches!(
        sa.allocate(50, 1),
        Err(AllocError::OutOfSpace { .. })
    ));
    assert!(sa.allocate(25, 1).is_ok());
}

#[test]
fn double_release_is_rejected() {
    let mut sa = SubAllocator::new(256, 1).unwrap();
    let a = sa.allocate(64, 1).unwrap();
    let _b = sa.allocate(64, 1).unwrap();

    sa.release(a.id).unwrap();
    let free_before = sa.free_size();
    assert!(matches!(
        sa.release(a.id),
        Err(AllocError::InvalidArgument(_))
    ));
    assert_eq!(sa.free_size(), free_before);
    assert!(sa.validate().is_ok());
}

#[test]
fn random_workload_keeps_invariants() {
    const ALIGNMENTS: [u64; 6] = [0, 1, 4, 16, 64, 256];

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut sa = SubAllocator::new(16 * 1024, 4).unwrap();
    let mut live: Vec<Suballocation> = Vec::new();

    for _ in 0..2000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = rng.gen_range(1..=512);
            let alignment = ALIGNMENTS[rng.gen_range(0..ALIGNMENTS.len())];
            let effective = if alignment == 0 { 4 } else { alignment };
            match sa.allocate(size, alignment) {
                Ok(a) => {
                    assert_eq!(a.offset % effective, 0);
                    live.push(a);
                }
                // Any range of `size + effective - 1` bytes would have fit.
                Err(AllocError::OutOfSpace { largest_free, .. }) => {
                    assert!(largest_free < size + effective - 1);
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        } else {
            let victim = live.swap_remove(rng.gen_range(0..live.len()));
            sa.release(victim.id).unwrap();
        }

        assert_conserved(&sa);
        assert_no_overlap(&sa);
    }

    for a in live.drain(..) {
        sa.release(a.id).unwrap();
    }
    assert_eq!(sa.free_size(), sa.capacity());
    assert_eq!(sa.free_ranges().count(), 1);
    assert!(sa.is_empty());
}

