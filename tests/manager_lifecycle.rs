//! End-to-end extent lifecycle through the manager

use dashmap::DashMap;
use hyperhold::config::{CACHE_LEVEL_FAULT_OUT, CACHE_LEVEL_RECLAIM_IN};
use hyperhold::error::{Error, Result};
use hyperhold::tier::{
    ExtentId, ExtentPages, FaultIn, GroupId, Manager, MemoryStore, ObjectFlags, ObjectId, PrimaryStore, Scenario,
    PAGE_SIZE,
};
use hyperhold::TierConfig;
use std::sync::Arc;

fn config(nr_objects: u32, nr_extents: u32) -> TierConfig {
    let mut config = TierConfig::default();
    config.area.nr_objects = nr_objects;
    config.area.nr_extents = nr_extents;
    config.area.extent_shift = 13;
    config.area.nr_groups = 16;
    config
}

fn manager(config: TierConfig) -> Result<Manager<MemoryStore>> {
    let store = Arc::new(MemoryStore::new(config.area.nr_objects));
    Manager::new(config, store)
}

fn page(obj: u32) -> Vec<u8> {
    (0..PAGE_SIZE as u32)
        .map(|i| ((i / 16).wrapping_add(obj) % 11) as u8)
        .collect()
}

fn tier_addr(mgr: &Manager<MemoryStore>, obj: u32) -> Result<Option<u64>> {
    mgr.store().with_object(ObjectId(obj), |m| {
        m.flags.contains(ObjectFlags::IN_TIER).then_some(m.handle)
    })
}

#[test]
fn test_watermark_triggers_compaction() -> Result<()> {
    let mut config = config(256, 100);
    config.cache.reclaim_in = true;
    let mgr = manager(config)?;
    let g = GroupId(1);
    mgr.attach_group(g)?;

    for obj in 0..80 {
        mgr.write_page(ObjectId(obj), g, &page(obj))?;
        let io = mgr.create(g)?;
        mgr.register(io, true)?;
    }
    assert_eq!(mgr.area().stored_extents(), 80);
    assert_eq!(mgr.stats().compacted_extents, 0);

    mgr.write_page(ObjectId(80), g, &page(80))?;
    let io = mgr.create(g)?;
    let stats = mgr.stats();
    assert!(stats.compacted_extents >= 10);
    assert!(io.objects().len() > 1);
    mgr.register(io, true)?;
    assert_eq!(mgr.area().stored_extents(), 71);

    for obj in 0..=80 {
        assert_eq!(mgr.read_page(ObjectId(obj))?, page(obj));
    }
    Ok(())
}

#[test]
fn test_out_of_space_is_reported() -> Result<()> {
    let mgr = manager(config(64, 2))?;
    let g = GroupId(1);
    mgr.attach_group(g)?;
    for obj in 0..3 {
        mgr.write_page(ObjectId(obj), g, &page(obj))?;
        match mgr.create(g) {
            Ok(io) => mgr.register(io, true)?,
            Err(Error::OutOfSpace(_)) => {
                assert_eq!(obj, 2);
                assert_eq!(mgr.stats().alloc_failures, 1);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
    panic!("third extent allocation should fail");
}

#[test]
fn test_fault_out_with_cache_pins_entry() -> Result<()> {
    let mut config = config(64, 8);
    config.cache.fault_out = true;
    let mgr = manager(config)?;
    let g = GroupId(1);
    mgr.attach_group(g)?;
    for obj in 0..4 {
        mgr.write_page(ObjectId(obj), g, &page(obj))?;
    }
    let io = mgr.create(g)?;
    let ext = io.extent();
    let device = io.pages().clone();
    mgr.register(io, true)?;
    assert!(!mgr.area().cache().lookup(ext));

    let addr = tier_addr(&mgr, 2)?.ok_or_else(|| Error::NotFound("obj 2".into()))?;
    let FaultIn::Io(mut io) = mgr.find_by_extent_id(addr)? else {
        panic!("extent was not cached yet");
    };
    *io.pages_mut() = device;
    mgr.destroy(io, Scenario::FaultOut)?;

    // Cached and pinned for the faulting reader.
    assert_eq!(mgr.area().cache().pins(ext), Some(1));
    assert!(mgr.area().cache().delete(ext).unwrap_err().is_busy());
    mgr.cache_out(ObjectId(2), Some(ext))?;
    assert_eq!(mgr.read_page(ObjectId(2))?, page(2));

    // A second fault is served straight from the cache.
    let addr = tier_addr(&mgr, 3)?.ok_or_else(|| Error::NotFound("obj 3".into()))?;
    assert!(matches!(mgr.find_by_extent_id(addr)?, FaultIn::Cached(e) if e == ext));
    mgr.cache_out(ObjectId(3), Some(ext))?;
    assert_eq!(mgr.area().stored_pages(ext), 2);
    assert_eq!(mgr.stats().cache_out_objects, 2);
    Ok(())
}

#[test]
fn test_checked_out_extent_is_busy_for_faults() -> Result<()> {
    let mgr = manager(config(64, 8))?;
    let g = GroupId(1);
    mgr.attach_group(g)?;
    mgr.write_page(ObjectId(0), g, &page(0))?;
    let io = mgr.create(g)?;
    mgr.register(io, true)?;

    let addr = tier_addr(&mgr, 0)?.ok_or_else(|| Error::NotFound("obj 0".into()))?;
    let FaultIn::Io(io) = mgr.find_by_extent_id(addr)? else {
        panic!("cache is disabled");
    };
    assert!(mgr.find_by_extent_id(addr).unwrap_err().is_busy());
    mgr.exception(Scenario::FaultOut, io)?;
    assert!(matches!(mgr.find_by_extent_id(addr)?, FaultIn::Io(_)));
    Ok(())
}

#[test]
fn test_concurrent_groups_round_trip() -> Result<()> {
    let mgr = manager(config(512, 128))?;
    mgr.set_cache_level(CACHE_LEVEL_FAULT_OUT | CACHE_LEVEL_RECLAIM_IN)?;
    let device: DashMap<ExtentId, ExtentPages> = DashMap::new();
    let groups: Vec<GroupId> = (1..=4).map(GroupId).collect();
    for &g in &groups {
        mgr.attach_group(g)?;
    }

    std::thread::scope(|s| -> Result<()> {
        let handles: Vec<_> = groups
            .iter()
            .map(|&g| {
                let (mgr, device) = (&mgr, &device);
                s.spawn(move || -> Result<()> {
                    let base = (g.0 as u32 - 1) * 100;
                    for obj in base..base + 100 {
                        mgr.write_page(ObjectId(obj), g, &page(obj))?;
                    }
                    loop {
                        let io = match mgr.create(g) {
                            Ok(io) => io,
                            Err(Error::NoEligibleObjects(_)) => break,
                            Err(e) => return Err(e),
                        };
                        device.insert(io.extent(), io.pages().clone());
                        mgr.register(io, true)?;
                    }
                    for obj in (base..base + 100).step_by(7) {
                        let Some(addr) = tier_addr(mgr, obj)? else { continue };
                        match mgr.find_by_extent_id(addr)? {
                            FaultIn::Cached(ext) => mgr.cache_out(ObjectId(obj), Some(ext))?,
                            FaultIn::Io(mut io) => {
                                let pages = device
                                    .get(&io.extent())
                                    .map(|p| p.clone())
                                    .ok_or_else(|| Error::NotFound("device extent".into()))?;
                                let ext = io.extent();
                                *io.pages_mut() = pages;
                                mgr.destroy(io, Scenario::FaultOut)?;
                                mgr.cache_out(ObjectId(obj), Some(ext))?;
                            }
                        }
                        assert_eq!(mgr.read_page(ObjectId(obj))?, page(obj));
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| Error::InvalidArgument("worker panicked".into()))??;
        }
        Ok(())
    })?;

    assert_eq!(mgr.area().stored_extents() as usize, mgr.area().allocated_bits());
    for obj in 0..400 {
        assert_eq!(mgr.read_page(ObjectId(obj))?, page(obj));
    }
    Ok(())
}

#[test]
fn test_batch_out_drains_group() -> Result<()> {
    let mgr = manager(config(128, 16))?;
    let g = GroupId(5);
    mgr.attach_group(g)?;
    let device: DashMap<ExtentId, ExtentPages> = DashMap::new();
    for round in 0..3u32 {
        for obj in round * 10..round * 10 + 10 {
            mgr.write_page(ObjectId(obj), g, &page(obj))?;
        }
        let io = mgr.create(g)?;
        device.insert(io.extent(), io.pages().clone());
        mgr.register(io, true)?;
    }
    assert_eq!(mgr.area().chain_extents(g)?.len(), 3);

    while let Ok(mut io) = mgr.find_by_group(g) {
        let pages = device
            .get(&io.extent())
            .map(|p| p.clone())
            .ok_or_else(|| Error::NotFound("device extent".into()))?;
        *io.pages_mut() = pages;
        mgr.destroy(io, Scenario::BatchOut)?;
    }
    assert_eq!(mgr.area().stored_extents(), 0);
    assert_eq!(mgr.stats().batch_out_extents, 3);
    for obj in 0..30 {
        assert_eq!(mgr.read_page(ObjectId(obj))?, page(obj));
    }
    Ok(())
}
