//! Allocation, chain and cache invariants of the extent area

use hyperhold::config::AreaConfig;
use hyperhold::error::{Error, Result};
use hyperhold::tier::{Area, ExtentFilter, ExtentId, ExtentPages, GroupId, GroupRegistry, PAGE_SIZE};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

fn area(nr_extents: u32, extent_shift: u32) -> Result<(Area, Arc<GroupRegistry>)> {
    let groups = Arc::new(GroupRegistry::new());
    let config = AreaConfig {
        nr_objects: 128,
        nr_extents,
        extent_shift,
        nr_groups: 16,
    };
    let area = Area::new(&config, 0, groups.clone())?;
    Ok((area, groups))
}

fn attach(area: &Area, groups: &GroupRegistry, id: u16) -> Result<GroupId> {
    let group = GroupId(id);
    groups.create(group, area.space().group(group)?)?;
    Ok(group)
}

proptest! {
    #[test]
    fn prop_population_matches_stored_counter(
        ops in proptest::collection::vec((any::<bool>(), 0u32..16), 1..200),
    ) {
        let (area, groups) = area(16, 13).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let g = attach(&area, &groups, 1).map_err(|e| TestCaseError::fail(e.to_string()))?;

        for (allocate, id) in ops {
            if allocate {
                match area.allocate_extent(g) {
                    Ok(_) | Err(Error::OutOfSpace(_)) => {}
                    Err(e) => return Err(TestCaseError::fail(e.to_string())),
                }
            } else {
                area.free_extent(ExtentId(id)).map_err(|e| TestCaseError::fail(e.to_string()))?;
            }
            prop_assert_eq!(area.stored_extents() as usize, area.allocated_bits());
            prop_assert_eq!(area.owned_extents(), area.stored_extents() as u64);
        }
    }
}

#[test]
fn test_concurrent_allocations_are_distinct() -> Result<()> {
    let (area, groups) = area(512, 13)?;
    let ids: Vec<_> = (1..=8).map(|i| attach(&area, &groups, i)).collect::<Result<_>>()?;

    let claimed: Vec<ExtentId> = std::thread::scope(|s| {
        let handles: Vec<_> = ids
            .iter()
            .map(|&g| {
                let area = &area;
                s.spawn(move || {
                    let mut mine = Vec::new();
                    while let Ok(ext) = area.allocate_extent(g) {
                        mine.push(ext);
                    }
                    mine
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap_or_default())
            .collect()
    });

    let unique: HashSet<_> = claimed.iter().collect();
    assert_eq!(claimed.len(), 512);
    assert_eq!(unique.len(), 512);
    assert_eq!(area.stored_extents(), 512);
    assert_eq!(area.owned_extents(), 512);
    Ok(())
}

#[test]
fn test_free_never_allocated_then_allocate() -> Result<()> {
    let (area, groups) = area(4, 13)?;
    let g = attach(&area, &groups, 1)?;
    area.free_extent(ExtentId(1))?;
    let a = area.allocate_extent(g)?;
    let b = area.allocate_extent(g)?;
    assert_ne!(a, b);
    assert_eq!(area.stored_extents(), 2);
    assert_eq!(area.allocated_bits(), 2);
    Ok(())
}

#[test]
fn test_checkout_busy_until_checkin() -> Result<()> {
    let (area, groups) = area(4, 13)?;
    let g = attach(&area, &groups, 1)?;
    let ext = area.allocate_extent(g)?;
    area.checkin_extent(ext)?;

    area.checkout_extent(ext)?;
    assert!(area.checkout_extent(ext).unwrap_err().is_busy());
    area.checkin_extent(ext)?;
    area.checkout_extent(ext)?;
    Ok(())
}

#[test]
fn test_pick_yields_insertion_order_then_empty() -> Result<()> {
    let (area, groups) = area(16, 13)?;
    let g = attach(&area, &groups, 2)?;
    let mut inserted = Vec::new();
    for _ in 0..6 {
        let ext = area.allocate_extent(g)?;
        inserted.push(ext);
    }
    // Commit in a shuffled order; the chain records commit order.
    let order = [4, 0, 5, 2, 1, 3];
    let committed: Vec<_> = order.iter().map(|&i| inserted[i]).collect();
    for &ext in &committed {
        area.checkin_extent(ext)?;
    }

    let picked: Vec<_> = (0..6)
        .map(|_| area.pick_extent(g, ExtentFilter::Any))
        .collect::<Result<_>>()?;
    assert_eq!(picked, committed);
    assert!(area.chain_extents(g)?.is_empty());
    assert!(area.pick_extent(g, ExtentFilter::Any).unwrap_err().is_not_found());
    Ok(())
}

#[test]
fn test_fragmentation_example() -> Result<()> {
    let (area, groups) = area(10, 13)?;
    let g = attach(&area, &groups, 1)?;
    for _ in 0..6 {
        area.allocate_extent(g)?;
    }

    area.checkin_extent(ExtentId(3))?;
    area.checkin_extent(ExtentId(5))?;
    assert_eq!(area.group_fragments(g), 2);

    area.checkin_extent(ExtentId(4))?;
    assert_eq!(area.group_fragments(g), 1);

    area.checkout_extent(ExtentId(4))?;
    area.free_extent(ExtentId(4))?;
    assert_eq!(area.group_fragments(g), 2);
    Ok(())
}

#[test]
fn test_fragmentation_adjacent_pair_is_one_run() -> Result<()> {
    // Extents 3 and 4 touch, so they form a single run rather than two.
    let (area, groups) = area(10, 13)?;
    let g = attach(&area, &groups, 1)?;
    for _ in 0..6 {
        area.allocate_extent(g)?;
    }

    area.checkin_extent(ExtentId(3))?;
    area.checkin_extent(ExtentId(4))?;
    assert_eq!(area.group_fragments(g), 1);

    area.checkin_extent(ExtentId(5))?;
    assert_eq!(area.group_fragments(g), 1);

    area.checkout_extent(ExtentId(4))?;
    area.free_extent(ExtentId(4))?;
    assert_eq!(area.group_fragments(g), 2);
    Ok(())
}

#[test]
fn test_fragmentation_ignores_other_groups() -> Result<()> {
    let (area, groups) = area(10, 13)?;
    let g1 = attach(&area, &groups, 1)?;
    let g2 = attach(&area, &groups, 2)?;
    let a = area.allocate_extent(g1)?;
    let b = area.allocate_extent(g2)?;
    let c = area.allocate_extent(g1)?;
    assert_eq!((a, b, c), (ExtentId(0), ExtentId(1), ExtentId(2)));

    for ext in [a, b, c] {
        area.checkin_extent(ext)?;
    }
    assert_eq!(area.group_fragments(g1), 2);
    assert_eq!(area.group_fragments(g2), 1);
    assert_eq!(area.frag_stats().runs, 3);
    assert_eq!(area.frag_stats().groups, 2);
    Ok(())
}

#[test]
fn test_cache_round_trip_and_pinning() -> Result<()> {
    let (area, _) = area(4, 13)?;
    let cache = area.cache();
    let ext = ExtentId(1);

    cache.insert(ext, ExtentPages::new(2), false)?;
    assert!(cache.lookup(ext));
    cache.delete(ext)?;
    assert!(!cache.lookup(ext));

    cache.insert(ext, ExtentPages::new(2), true)?;
    assert!(cache.delete(ext).unwrap_err().is_busy());
    assert!(cache.lookup(ext));
    Ok(())
}

#[test]
fn test_cache_straddling_read() -> Result<()> {
    let (area, _) = area(4, 13)?;
    let geometry = *area.geometry();
    let ext = ExtentId(2);
    let mut pages = ExtentPages::new(2);
    let data: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
    let offset = PAGE_SIZE - 100;
    pages.write_at(offset, &data)?;
    area.cache().insert(ext, pages, false)?;

    let mut whole = vec![0u8; 300];
    area.cache().read(ext, geometry.addr(ext, offset), &mut whole)?;

    let mut head = vec![0u8; 100];
    let mut tail = vec![0u8; 200];
    area.cache().read(ext, geometry.addr(ext, offset), &mut head)?;
    area.cache().read(ext, geometry.addr(ext, PAGE_SIZE), &mut tail)?;

    assert_eq!(whole, [head, tail].concat());
    assert_eq!(whole, data);
    Ok(())
}

#[test]
fn test_cached_extent_freed_with_area() -> Result<()> {
    let (area, groups) = area(4, 13)?;
    let g = attach(&area, &groups, 1)?;
    let ext = area.allocate_extent(g)?;
    area.cache().insert(ext, ExtentPages::new(2), false)?;
    area.free_extent(ext)?;
    assert!(!area.cache().lookup(ext));
    assert_eq!(area.cache().len(), 0);
    Ok(())
}

#[test]
fn test_free_supersedes_pinned_cache_entry() -> Result<()> {
    let (area, groups) = area(1, 13)?;
    let g = attach(&area, &groups, 1)?;
    let ext = area.allocate_extent(g)?;
    area.cache().insert(ext, ExtentPages::new(2), true)?;
    let reader = area.cache().get(ext).ok_or_else(|| Error::NotFound("cached extent".into()))?;

    area.free_extent(ext)?;
    assert!(!area.cache().lookup(ext));
    assert_eq!(reader.pins(), 1);

    // The id comes back and takes a fresh cache entry.
    let again = area.allocate_extent(g)?;
    assert_eq!(again, ext);
    area.cache().insert(again, ExtentPages::new(2), false)?;
    assert_eq!(area.cache().pins(again), Some(0));
    Ok(())
}
