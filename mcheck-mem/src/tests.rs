use crate::{
    AddressSpace, BufferSpace, PageList, PageStore, RegionSnapshot, RegionType, StoreError,
    PAGE_SIZE,
};

const BASE: u64 = 0x10_0000;

fn page_of(value: u8) -> Vec<u8> {
    vec![value; PAGE_SIZE]
}

fn space_with(pages: usize) -> BufferSpace {
    let mut space = BufferSpace::new();
    space.map(BASE, (pages * PAGE_SIZE) as u64);
    space
}

fn read_all(space: &BufferSpace, size: usize) -> Vec<u8> {
    let mut buf = vec![0; size];
    space.read_bytes(BASE, &mut buf).unwrap();
    buf
}

fn sparse(
    space: &BufferSpace,
    store: &PageStore,
    pages: usize,
    reference: Option<&RegionSnapshot>,
) -> RegionSnapshot {
    let size = (pages * PAGE_SIZE) as u64;
    RegionSnapshot::sparse(space, store, RegionType::Data, BASE, BASE, size, reference).unwrap()
}

#[test]
fn identical_pages_are_shared() {
    let store = PageStore::new(16);

    let a = store.store_page(&page_of(1)).unwrap();
    let b = store.store_page(&page_of(1)).unwrap();
    let c = store.store_page(&page_of(2)).unwrap();

    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(store.refcount(a), 2);
    assert_eq!(store.live_pages(), 2);
}

#[test]
fn released_pages_are_reused() {
    let store = PageStore::new(16);

    let a = store.store_page(&page_of(1)).unwrap();
    store.unref_page(a);
    assert_eq!(store.live_pages(), 0);
    assert_eq!(store.refcount(a), 0);

    // The content of a released page must not be found by deduplication.
    let b = store.store_page(&page_of(2)).unwrap();
    assert_eq!(a, b);
    let mut out = page_of(0);
    store.read_page(b, &mut out);
    assert_eq!(out, page_of(2));

    let c = store.store_page(&page_of(1)).unwrap();
    assert_ne!(b, c);
}

#[test]
#[should_panic(expected = "page refcount underflow")]
fn refcount_underflow_panics() {
    let store = PageStore::new(16);
    let a = store.store_page(&page_of(1)).unwrap();
    store.unref_page(a);
    store.unref_page(a);
}

#[test]
fn page_limit() {
    let store = PageStore::new(2);
    store.store_page(&page_of(1)).unwrap();
    store.store_page(&page_of(2)).unwrap();
    assert_eq!(store.store_page(&page_of(3)), Err(StoreError::OutOfPages { capacity: 2 }));

    // Storing existing content does not need a new slot.
    assert!(store.store_page(&page_of(1)).is_ok());
}

#[test]
fn page_list_owns_references() {
    let store = PageStore::new(16);

    let mut list = PageList::new(&store);
    let a = list.push_data(&page_of(7)).unwrap();
    list.push_shared(a);
    assert_eq!(store.refcount(a), 2);

    let copy = list.clone();
    assert_eq!(store.refcount(a), 4);
    assert_eq!(copy, list);

    drop(list);
    assert_eq!(store.refcount(a), 2);
    drop(copy);
    assert_eq!(store.live_pages(), 0);
}

#[test]
fn dense_round_trip() {
    let mut space = space_with(3);
    space.write_bytes(BASE + 0x10, b"hello").unwrap();
    space.write_bytes(BASE + 0x2ff0, &[0xab; 0x10]).unwrap();
    let before = read_all(&space, 3 * PAGE_SIZE);

    let size = 3 * PAGE_SIZE as u64 - 0x100;
    let region = RegionSnapshot::dense(&space, RegionType::Heap, BASE, BASE, size).unwrap();
    space.write_bytes(BASE + 0x10, b"world").unwrap();
    space.clear_bytes(BASE + 0x2000, 0xf00).unwrap();

    region.restore(&mut space, None).unwrap();
    assert_eq!(read_all(&space, 3 * PAGE_SIZE), before);
}

#[test]
fn sparse_round_trip() {
    let store = PageStore::new(64);
    let mut space = space_with(4);
    space.write_bytes(BASE + 0x1234, &[0x55; 0x2000]).unwrap();
    let before = read_all(&space, 4 * PAGE_SIZE);

    let region = sparse(&space, &store, 4, None);
    space.write_bytes(BASE, &[0x11; 4 * PAGE_SIZE]).unwrap();

    region.restore(&mut space, None).unwrap();
    assert_eq!(read_all(&space, 4 * PAGE_SIZE), before);

    // Restoring again is a no-op.
    region.restore(&mut space, None).unwrap();
    assert_eq!(read_all(&space, 4 * PAGE_SIZE), before);
}

#[test]
fn sparse_requires_alignment() {
    let store = PageStore::new(8);
    let space = space_with(2);
    let err = RegionSnapshot::sparse(&space, &store, RegionType::Data, BASE, BASE + 8, 0x1000, None)
        .unwrap_err();
    assert_eq!(err, StoreError::Misaligned { addr: BASE + 8, size: 0x1000 });
}

#[test]
fn soft_clean_pages_reuse_parent() {
    // 16 MiB
    const PAGES: usize = 4096;

    let store = PageStore::new(PAGES + 16);
    let mut space = space_with(PAGES);

    let parent = sparse(&space, &store, PAGES, None);
    space.reset_soft_dirty().unwrap();
    let live_before = store.live_pages();
    assert_eq!(live_before, 1, "zero pages should be shared");

    for (i, page) in [3, 1000, 4095].into_iter().enumerate() {
        space.write_bytes(BASE + (page * PAGE_SIZE) as u64 + 8, &[i as u8 + 1; 16]).unwrap();
    }

    let child = sparse(&space, &store, PAGES, Some(&parent));
    let (a, b) = (parent.page_list().unwrap(), child.page_list().unwrap());
    let changed: Vec<usize> = (0..PAGES).filter(|i| a.get(*i) != b.get(*i)).collect();
    assert_eq!(changed, vec![3, 1000, 4095]);
    assert_eq!(store.live_pages(), live_before + 3);
}

#[test]
fn unmodified_capture_matches_full_capture() {
    let store = PageStore::new(64);
    let mut space = space_with(8);
    for i in 0..8 {
        space.write_bytes(BASE + (i * PAGE_SIZE) as u64, &[i as u8; 32]).unwrap();
    }

    let parent = sparse(&space, &store, 8, None);
    space.reset_soft_dirty().unwrap();
    let live = store.live_pages();

    let incremental = sparse(&space, &store, 8, Some(&parent));
    assert_eq!(store.live_pages(), live);
    for index in incremental.page_list().unwrap().pages() {
        assert_eq!(store.refcount(*index), 2);
    }

    let full = sparse(&space, &store, 8, None);
    assert_eq!(incremental.page_list(), full.page_list());
    assert!(incremental.content_eq(&full));
}

#[test]
fn restore_skips_shared_clean_pages() {
    let store = PageStore::new(64);
    let mut space = space_with(8);
    space.write_bytes(BASE + 0x10, &[1; 8]).unwrap();

    let snapshot = sparse(&space, &store, 8, None);
    space.reset_soft_dirty().unwrap();
    space.take_page_writes();

    space.write_bytes(BASE + 5 * PAGE_SIZE as u64, &[9; 8]).unwrap();
    space.take_page_writes();

    snapshot.restore(&mut space, Some(&snapshot)).unwrap();
    assert_eq!(space.take_page_writes(), 1);

    let mut buf = [0; 8];
    space.read_bytes(BASE + 5 * PAGE_SIZE as u64, &mut buf).unwrap();
    assert_eq!(buf, [0; 8]);
}

#[test]
fn restore_with_other_parent() {
    let store = PageStore::new(64);
    let mut space = space_with(4);

    space.write_bytes(BASE, &[1; 16]).unwrap();
    let first = sparse(&space, &store, 4, None);
    let first_bytes = read_all(&space, 4 * PAGE_SIZE);
    space.reset_soft_dirty().unwrap();

    space.write_bytes(BASE + PAGE_SIZE as u64, &[2; 16]).unwrap();
    let second = sparse(&space, &store, 4, Some(&first));
    let second_bytes = read_all(&space, 4 * PAGE_SIZE);
    space.reset_soft_dirty().unwrap();

    first.restore(&mut space, Some(&second)).unwrap();
    assert_eq!(read_all(&space, 4 * PAGE_SIZE), first_bytes);
    space.reset_soft_dirty().unwrap();

    second.restore(&mut space, Some(&first)).unwrap();
    assert_eq!(read_all(&space, 4 * PAGE_SIZE), second_bytes);
}

#[test]
fn dropping_regions_releases_pages() {
    let store = PageStore::new(64);
    let mut space = space_with(4);
    space.write_bytes(BASE, &[3; 4 * PAGE_SIZE]).unwrap();
    space.write_bytes(BASE + 2 * PAGE_SIZE as u64, &[4; 4]).unwrap();

    let parent = sparse(&space, &store, 4, None);
    space.reset_soft_dirty().unwrap();
    let child = sparse(&space, &store, 4, Some(&parent));
    assert_eq!(store.live_pages(), 2);

    drop(parent);
    assert_eq!(store.live_pages(), 2);
    drop(child);
    assert_eq!(store.live_pages(), 0);
}

#[test]
fn saved_content_reads() {
    let store = PageStore::new(64);
    let mut space = space_with(2);
    space.write_bytes(BASE + PAGE_SIZE as u64 - 2, &[1, 2, 3, 4]).unwrap();

    let region = sparse(&space, &store, 2, None);
    let mut buf = [0; 4];
    region.read_saved(PAGE_SIZE as u64 - 2, &mut buf);
    assert_eq!(buf, [1, 2, 3, 4]);

    let dense =
        RegionSnapshot::dense(&space, RegionType::Data, BASE, BASE, 2 * PAGE_SIZE as u64).unwrap();
    assert!(dense.content_eq(&region));

    space.write_bytes(BASE, &[1]).unwrap();
    let changed = sparse(&space, &store, 2, None);
    assert!(!changed.content_eq(&region));
}

#[test]
fn round_trip_after_arbitrary_writes() {
    fn check(initial: Vec<(u16, u8)>, modified: Vec<(u16, u8)>, use_parent: bool) -> bool {
        const PAGES: usize = 16;
        let store = PageStore::new(64);
        let mut space = space_with(PAGES);

        let scale = |offset: u16| BASE + offset as u64 * (PAGES * PAGE_SIZE / 0x10000) as u64;
        for (offset, value) in &initial {
            space.write_bytes(scale(*offset), &[*value]).unwrap();
        }
        let parent = sparse(&space, &store, PAGES, None);
        space.reset_soft_dirty().unwrap();

        for (offset, value) in &modified {
            space.write_bytes(scale(*offset), &[*value]).unwrap();
        }
        let expected = read_all(&space, PAGES * PAGE_SIZE);
        let snapshot = sparse(&space, &store, PAGES, use_parent.then_some(&parent));
        space.reset_soft_dirty().unwrap();

        for (offset, value) in &initial {
            space.write_bytes(scale(*offset), &[value.wrapping_add(1)]).unwrap();
        }
        snapshot.restore(&mut space, use_parent.then_some(&snapshot)).unwrap();
        read_all(&space, PAGES * PAGE_SIZE) == expected
    }
    quickcheck::quickcheck(check as fn(Vec<(u16, u8)>, Vec<(u16, u8)>, bool) -> bool);
}
